//! Transport configuration, and the subset of it that shapes a connection handler.

use http::uri::Authority;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::client::HandlerOptions;

/// Decides from the declared content length whether a response body is streamed to the caller
/// instead of buffered.
pub type StreamingPredicate = Arc<dyn Fn(Option<u64>) -> bool + Send + Sync>;

/// Allocates the buffer a response body of the given length is read into. The buffer may be
/// longer than requested.
pub type BufferFactory = Arc<dyn Fn(usize) -> Vec<u8> + Send + Sync>;

/// Last-chance adjustment of a handler's options before it is built.
pub type HandlerTuning = Arc<dyn Fn(&mut HandlerOptions) + Send + Sync>;

#[derive(Clone)]
pub struct TransportSettings {
    /// Used when a send does not pass its own connection timeout. `None` is infinite.
    pub connection_timeout: Option<Duration>,
    pub connection_idle_timeout: Duration,
    /// How long a timed-out send is given to unwind after it is aborted.
    pub request_abort_timeout: Duration,
    pub proxy: Option<Arc<Proxy>>,
    pub max_connections_per_endpoint: usize,
    /// `None` means response bodies of any size are buffered.
    pub max_response_body_size: Option<u64>,
    /// How much of an unwanted response body is read off a connection to keep it reusable.
    pub max_response_drain_size: u64,
    pub use_response_streaming: StreamingPredicate,
    pub allow_auto_redirect: bool,
    /// `None` means connections are reused for as long as they stay healthy.
    pub connection_lifetime: Option<Duration>,
    pub buffer_factory: BufferFactory,
    pub tune_handler: Option<HandlerTuning>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connection_timeout: Some(Duration::from_millis(750)),
            connection_idle_timeout: Duration::from_secs(2 * 60),
            request_abort_timeout: Duration::from_millis(250),
            proxy: None,
            max_connections_per_endpoint: 10_000,
            max_response_body_size: None,
            max_response_drain_size: 1024 * 1024,
            use_response_streaming: Arc::new(|_| false),
            allow_auto_redirect: false,
            connection_lifetime: None,
            buffer_factory: Arc::new(|size| vec![0; size]),
            tune_handler: None,
        }
    }
}

impl TransportSettings {
    /// Key of the handler serving sends made with `connection_timeout`.
    pub(crate) fn connection_settings(&self, connection_timeout: Option<Duration>) -> ConnectionSettings {
        ConnectionSettings {
            connection_timeout,
            proxy: self.proxy.clone(),
            allow_auto_redirect: self.allow_auto_redirect,
            idle_timeout: self.connection_idle_timeout,
            connection_lifetime: self.connection_lifetime,
            max_connections_per_endpoint: self.max_connections_per_endpoint,
            max_response_drain_size: self.max_response_drain_size,
            tuning: self.tune_handler.clone(),
        }
    }
}

impl fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSettings")
            .field("connection_timeout", &self.connection_timeout)
            .field("connection_idle_timeout", &self.connection_idle_timeout)
            .field("request_abort_timeout", &self.request_abort_timeout)
            .field("proxy", &self.proxy)
            .field("max_connections_per_endpoint", &self.max_connections_per_endpoint)
            .field("max_response_body_size", &self.max_response_body_size)
            .field("max_response_drain_size", &self.max_response_drain_size)
            .field("allow_auto_redirect", &self.allow_auto_redirect)
            .field("connection_lifetime", &self.connection_lifetime)
            .finish_non_exhaustive()
    }
}

/// An HTTP forward proxy.
#[derive(Debug)]
pub struct Proxy {
    authority: Authority,
}

impl Proxy {
    pub fn new(authority: Authority) -> Self {
        Self { authority }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

impl FromStr for Proxy {
    type Err = http::uri::InvalidUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.parse()?))
    }
}

/// Everything that shapes a connection handler. Handlers are cached per distinct value.
///
/// The proxy and the tuning hook are caller-owned objects and compare by identity.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub connection_timeout: Option<Duration>,
    pub proxy: Option<Arc<Proxy>>,
    pub allow_auto_redirect: bool,
    pub idle_timeout: Duration,
    pub connection_lifetime: Option<Duration>,
    pub max_connections_per_endpoint: usize,
    pub max_response_drain_size: u64,
    pub tuning: Option<HandlerTuning>,
}

fn same_arc<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ()),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for ConnectionSettings {
    fn eq(&self, other: &Self) -> bool {
        self.connection_timeout == other.connection_timeout
            && same_arc(&self.proxy, &other.proxy)
            && self.allow_auto_redirect == other.allow_auto_redirect
            && self.idle_timeout == other.idle_timeout
            && self.connection_lifetime == other.connection_lifetime
            && self.max_connections_per_endpoint == other.max_connections_per_endpoint
            && self.max_response_drain_size == other.max_response_drain_size
            && same_arc(&self.tuning, &other.tuning)
    }
}

impl Eq for ConnectionSettings {}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("connection_timeout", &self.connection_timeout)
            .field("proxy", &self.proxy)
            .field("allow_auto_redirect", &self.allow_auto_redirect)
            .field("idle_timeout", &self.idle_timeout)
            .field("connection_lifetime", &self.connection_lifetime)
            .field("max_connections_per_endpoint", &self.max_connections_per_endpoint)
            .field("max_response_drain_size", &self.max_response_drain_size)
            .field("tuning", &self.tuning.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_equal_settings() {
        let settings = TransportSettings::default();
        let a = settings.connection_settings(Some(Duration::from_secs(1)));
        let b = settings.connection_settings(Some(Duration::from_secs(1)));
        assert_eq!(a, b);

        let c = settings.connection_settings(None);
        assert_ne!(a, c);
    }

    #[test]
    fn test_proxy_compares_by_identity() {
        let mut settings = TransportSettings::default();
        settings.proxy = Some(Arc::new("proxy.local:3128".parse().unwrap()));
        let a = settings.connection_settings(None);

        let mut other = settings.clone();
        assert_eq!(a, other.connection_settings(None));

        other.proxy = Some(Arc::new("proxy.local:3128".parse().unwrap()));
        assert_ne!(a, other.connection_settings(None));
    }

    #[test]
    fn test_tuning_compares_by_identity() {
        let mut settings = TransportSettings::default();
        settings.tune_handler = Some(Arc::new(|_: &mut HandlerOptions| {}));
        let a = settings.connection_settings(None);
        assert_eq!(a, settings.connection_settings(None));

        settings.tune_handler = Some(Arc::new(|_: &mut HandlerOptions| {}));
        assert_ne!(a, settings.connection_settings(None));
    }
}
