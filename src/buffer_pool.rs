//! Pool of fixed-size scratch buffers.
//!
//! Body readers and writers borrow a buffer for the duration of one copy loop. At most
//! `max_retained` buffers are ever drawn from the pool, so that is all it keeps; borrowers past
//! that get a plain allocation that is freed on return.

use byte_pool::{Block, BytePool};
use lazy_static::lazy_static;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of the buffers handed out by the shared pool.
pub const SCRATCH_BUFFER_SIZE: usize = 16 * 1024;

/// Buffers a pool keeps unless built with [`BufferPool::with_max_retained`].
pub const DEFAULT_MAX_RETAINED: usize = 64;

lazy_static! {
    static ref SHARED: BufferPool = BufferPool::new(SCRATCH_BUFFER_SIZE);
}

pub struct BufferPool {
    pool: BytePool<Vec<u8>>,
    buffer_size: usize,
    max_retained: usize,
    lent: AtomicUsize,
}

impl BufferPool {
    /// # Panics
    /// if `buffer_size` is zero.
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_retained(buffer_size, DEFAULT_MAX_RETAINED)
    }

    /// # Panics
    /// if `buffer_size` is zero.
    pub fn with_max_retained(buffer_size: usize, max_retained: usize) -> Self {
        assert!(buffer_size > 0, "buffer size must be non-zero");
        Self {
            pool: BytePool::new(),
            buffer_size,
            max_retained,
            lent: AtomicUsize::new(0),
        }
    }

    /// Process-wide pool used by the transport.
    pub fn shared() -> &'static BufferPool {
        &SHARED
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Check out a buffer. It goes back to the pool when the guard is dropped, on every exit
    /// path. Contents are not zeroed between borrowers.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let lent = self.lent.fetch_add(1, Ordering::AcqRel);
        let storage = if lent < self.max_retained {
            Storage::Pooled(self.pool.alloc(self.buffer_size))
        } else {
            Storage::Spare(vec![0; self.buffer_size])
        };
        PooledBuffer {
            storage: Some(storage),
            len: self.buffer_size,
            lent: &self.lent,
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_retained", &self.max_retained)
            .finish()
    }
}

enum Storage<'a> {
    Pooled(Block<'a, Vec<u8>>),
    Spare(Vec<u8>),
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    storage: Option<Storage<'a>>,
    len: usize,
    lent: &'a AtomicUsize,
}

impl PooledBuffer<'_> {
    #[cfg(test)]
    fn is_pooled(&self) -> bool {
        matches!(self.storage, Some(Storage::Pooled(_)))
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.storage {
            Some(Storage::Pooled(block)) => &block[..self.len],
            Some(Storage::Spare(buf)) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(Storage::Pooled(block)) => &mut block[..self.len],
            Some(Storage::Spare(buf)) => &mut buf[..self.len],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        // the block is back in the pool before the slot is counted free
        drop(self.storage.take());
        self.lent.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_buffer_size() {
        let pool = BufferPool::new(64);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_buffer_is_reused_after_release() {
        let pool = BufferPool::new(64);
        let first = pool.acquire();
        let ptr = first.as_ptr();
        drop(first);

        let second = pool.acquire();
        assert_eq!(second.as_ptr(), ptr);
    }

    #[test]
    fn test_outstanding_buffers_are_distinct() {
        let pool = BufferPool::new(64);
        let mut first = pool.acquire();
        let mut second = pool.acquire();
        first[0] = 1;
        second[0] = 2;
        assert_ne!(first.as_ptr(), second.as_ptr());
        assert_eq!(first[0], 1);
    }

    #[test]
    fn test_borrowers_past_the_cap_are_not_pooled() {
        let pool = BufferPool::with_max_retained(64, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let mut c = pool.acquire();
        assert!(a.is_pooled() && b.is_pooled());
        assert!(!c.is_pooled());
        c[63] = 7;
        assert_eq!(c.len(), 64);

        drop(a);
        let d = pool.acquire();
        assert!(!d.is_pooled());

        drop(c);
        drop(d);
        let e = pool.acquire();
        assert!(e.is_pooled());
    }

    #[test]
    fn test_shared_pool() {
        let buf = BufferPool::shared().acquire();
        assert_eq!(buf.len(), SCRATCH_BUFFER_SIZE);
    }
}
