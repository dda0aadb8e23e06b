//! Two-tier cache of connection handlers.
//!
//! Each transport keeps a handful of handlers keyed by connection timeout alone. Misses fall
//! through to a process-wide cache keyed by the full [`ConnectionSettings`], which bounds the
//! number of live handlers no matter how many distinct settings callers use. A transport's own
//! tier keeps its handlers alive even while other callers churn the shared one.
//!
//! Handlers are never expired by time, only recycled when a tier is full.

use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::client::{Handler, HandlerFactory, HandlerOptions};
use crate::settings::{ConnectionSettings, TransportSettings};

pub const LOCAL_CACHE_CAPACITY: usize = 3;
pub const GLOBAL_CACHE_CAPACITY: usize = 25;

lazy_static! {
    static ref SHARED: Arc<GlobalHandlerCache> =
        Arc::new(GlobalHandlerCache::with_capacity(GLOBAL_CACHE_CAPACITY));
}

/// Fixed-capacity map that recycles its least recently used entry when full.
///
/// Lookups and insertions happen under one lock, so a value is created at most once per key.
pub(crate) struct RecyclingCache<K, V> {
    capacity: usize,
    inner: Mutex<Slots<K, V>>,
}

struct Slots<K, V> {
    entries: Vec<Slot<K, V>>,
    clock: u64,
}

struct Slot<K, V> {
    key: K,
    value: V,
    last_used: u64,
}

impl<K: Eq, V: Clone> RecyclingCache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            capacity,
            inner: Mutex::new(Slots {
                entries: Vec::with_capacity(capacity),
                clock: 0,
            }),
        }
    }

    /// Returns the value for `key`, creating it on a miss. The second element is the entry
    /// recycled to make room, if any.
    pub(crate) fn obtain<F>(&self, key: K, create: F) -> (V, Option<V>)
    where
        F: FnOnce(&K) -> V,
    {
        let mut slots = self.inner.lock().expect("handler cache poisoned");
        slots.clock += 1;
        let now = slots.clock;

        if let Some(slot) = slots.entries.iter_mut().find(|slot| slot.key == key) {
            slot.last_used = now;
            return (slot.value.clone(), None);
        }

        let value = create(&key);
        let slot = Slot {
            key,
            value: value.clone(),
            last_used: now,
        };

        if slots.entries.len() < self.capacity {
            slots.entries.push(slot);
            return (value, None);
        }

        let lru = slots
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let evicted = std::mem::replace(&mut slots.entries[lru], slot);
        (value, Some(evicted.value))
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("handler cache poisoned").entries.len()
    }
}

/// The process-wide tier.
///
/// A handler it recycles is closed right away unless some transport's local tier still holds it.
/// Such a handler keeps serving that transport, and its connections go away with the last
/// reference.
pub struct GlobalHandlerCache {
    cache: RecyclingCache<ConnectionSettings, Arc<dyn Handler>>,
}

impl GlobalHandlerCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: RecyclingCache::new(capacity),
        }
    }

    /// The instance shared by every transport built without an explicit cache. Lives for the
    /// rest of the process.
    pub fn shared() -> Arc<GlobalHandlerCache> {
        SHARED.clone()
    }

    pub fn obtain(&self, settings: ConnectionSettings, factory: &dyn HandlerFactory) -> Arc<dyn Handler> {
        let (handler, evicted) = self.cache.obtain(settings, |settings| {
            debug!(?settings, "Creating connection handler");
            let mut options = HandlerOptions::from_settings(settings);
            if let Some(tune) = &settings.tuning {
                tune(&mut options);
            }
            factory.create(options)
        });

        if let Some(evicted) = evicted {
            // once out of the shared tier, nothing can take a new reference to it
            if Arc::strong_count(&evicted) == 1 {
                debug!("Closing recycled connection handler");
                evicted.close();
            } else {
                debug!("Recycled connection handler is still held by a transport");
            }
        }

        handler
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Both tiers, as seen from one transport.
pub struct ConnectionHandlerCache {
    local: RecyclingCache<Option<Duration>, Arc<dyn Handler>>,
    global: Arc<GlobalHandlerCache>,
    factory: Arc<dyn HandlerFactory>,
    settings: Arc<TransportSettings>,
}

impl ConnectionHandlerCache {
    pub fn new(
        settings: Arc<TransportSettings>,
        global: Arc<GlobalHandlerCache>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            local: RecyclingCache::new(LOCAL_CACHE_CAPACITY),
            global,
            factory,
            settings,
        }
    }

    /// Handler for sends made with `connection_timeout` (`None` is infinite).
    ///
    /// A handler recycled from the local tier is still owned by the global one, so it is left
    /// open.
    pub fn obtain(&self, connection_timeout: Option<Duration>) -> Arc<dyn Handler> {
        let (handler, _) = self.local.obtain(connection_timeout, |timeout| {
            let settings = self.settings.connection_settings(*timeout);
            self.global.obtain(settings, self.factory.as_ref())
        });
        handler
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::client::{ClientError, IncomingResponse, OutgoingRequest};
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeHandler {
        closed: Arc<AtomicBool>,
    }

    impl Handler for FakeHandler {
        fn dispatch(
            &self,
            _request: OutgoingRequest,
            _token: CancelToken,
        ) -> BoxFuture<'_, Result<IncomingResponse, ClientError>> {
            Box::pin(async { Err(ClientError::canceled()) })
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Keeps each handler's closed flag, not the handler itself.
    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        closed: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl CountingFactory {
        fn closed(&self) -> Vec<usize> {
            let flags = self.closed.lock().unwrap();
            flags
                .iter()
                .enumerate()
                .filter(|(_, closed)| closed.load(Ordering::SeqCst))
                .map(|(idx, _)| idx)
                .collect()
        }
    }

    impl HandlerFactory for CountingFactory {
        fn create(&self, _options: HandlerOptions) -> Arc<dyn Handler> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::new(AtomicBool::new(false));
            self.closed.lock().unwrap().push(closed.clone());
            Arc::new(FakeHandler { closed })
        }
    }

    fn key(idle_secs: u64) -> ConnectionSettings {
        let mut settings = TransportSettings::default();
        settings.connection_idle_timeout = Duration::from_secs(idle_secs);
        settings.connection_settings(None)
    }

    #[test]
    fn test_recycling_cache_evicts_least_recently_used() {
        let cache = RecyclingCache::new(2);
        assert_eq!(cache.obtain("a", |_| 1), (1, None));
        assert_eq!(cache.obtain("b", |_| 2), (2, None));
        // touch "a", so "b" is the oldest
        assert_eq!(cache.obtain("a", |_| 10), (1, None));
        assert_eq!(cache.obtain("c", |_| 3), (3, Some(2)));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.obtain("a", |_| 10), (1, None));
    }

    #[test]
    fn test_concurrent_obtain_constructs_once() {
        let factory = CountingFactory::default();
        let cache = GlobalHandlerCache::with_capacity(GLOBAL_CACHE_CAPACITY);

        let handlers = easy_parallel::Parallel::new()
            .each(0..16, |_| cache.obtain(key(60), &factory))
            .run();

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        for handler in &handlers[1..] {
            assert!(Arc::ptr_eq(&handlers[0], handler));
        }
    }

    #[test]
    fn test_overflow_evicts_and_closes_one_handler() {
        let factory = CountingFactory::default();
        let cache = GlobalHandlerCache::with_capacity(GLOBAL_CACHE_CAPACITY);

        for idle in 0..GLOBAL_CACHE_CAPACITY as u64 + 1 {
            cache.obtain(key(idle), &factory);
        }

        assert_eq!(cache.len(), GLOBAL_CACHE_CAPACITY);
        assert_eq!(factory.closed(), vec![0]);
    }

    #[test]
    fn test_eviction_spares_handler_held_by_local_tier() {
        let factory = Arc::new(CountingFactory::default());
        let global = Arc::new(GlobalHandlerCache::with_capacity(1));
        let settings = Arc::new(TransportSettings::default());
        let mine = ConnectionHandlerCache::new(settings, global.clone(), factory.clone());
        let before = mine.obtain(None);
        drop(before);

        let mut busy = TransportSettings::default();
        busy.connection_idle_timeout = Duration::from_secs(5);
        let theirs = ConnectionHandlerCache::new(Arc::new(busy), global.clone(), factory.clone());
        theirs.obtain(None);

        // evicted from the shared tier, but still open and still served locally
        assert!(factory.closed().is_empty());
        let after = mine.obtain(None);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        // a handler no transport holds is closed as soon as it is recycled
        drop(after);
        drop(mine);
        drop(theirs);
        let mut third = TransportSettings::default();
        third.connection_idle_timeout = Duration::from_secs(7);
        global.obtain(third.connection_settings(None), factory.as_ref());
        assert_eq!(factory.closed(), vec![1]);
    }

    #[test]
    fn test_tuning_hook_is_applied() {
        let mut settings = TransportSettings::default();
        settings.tune_handler = Some(Arc::new(|options: &mut HandlerOptions| {
            options.max_auto_redirects = 7;
        }));

        struct Inspect(AtomicUsize);
        impl HandlerFactory for Inspect {
            fn create(&self, options: HandlerOptions) -> Arc<dyn Handler> {
                self.0.store(options.max_auto_redirects, Ordering::SeqCst);
                Arc::new(FakeHandler {
                    closed: Arc::new(AtomicBool::new(false)),
                })
            }
        }

        let factory = Inspect(AtomicUsize::new(0));
        let cache = GlobalHandlerCache::with_capacity(1);
        cache.obtain(settings.connection_settings(None), &factory);
        assert_eq!(factory.0.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_local_tier_keys_by_connection_timeout() {
        let factory = Arc::new(CountingFactory::default());
        let global = Arc::new(GlobalHandlerCache::with_capacity(GLOBAL_CACHE_CAPACITY));
        let settings = Arc::new(TransportSettings::default());
        let cache = ConnectionHandlerCache::new(settings.clone(), global.clone(), factory.clone());

        let a = cache.obtain(Some(Duration::from_secs(1)));
        let b = cache.obtain(Some(Duration::from_secs(1)));
        assert!(Arc::ptr_eq(&a, &b));

        cache.obtain(None);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        // a second transport with equal settings shares the global handler
        let other = ConnectionHandlerCache::new(settings, global.clone(), factory.clone());
        let c = other.obtain(Some(Duration::from_secs(1)));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(global.len(), 2);
    }

    #[test]
    fn test_local_recycling_leaves_handler_open() {
        let factory = Arc::new(CountingFactory::default());
        let global = Arc::new(GlobalHandlerCache::with_capacity(GLOBAL_CACHE_CAPACITY));
        let cache = ConnectionHandlerCache::new(Arc::new(TransportSettings::default()), global, factory.clone());

        for ms in 1..=LOCAL_CACHE_CAPACITY as u64 + 1 {
            cache.obtain(Some(Duration::from_millis(ms)));
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), LOCAL_CACHE_CAPACITY + 1);
        assert!(factory.closed().is_empty());
    }
}
