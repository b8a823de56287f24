//! Bounded slab pool for byte buffers.
//!
//! Ingest paths churn through one buffer per datagram; the pool loans
//! buffers and reclaims them when the loan is dropped, so steady-state
//! traffic does not allocate. When the pool is empty a fresh allocation is
//! handed out instead, and buffers returned beyond capacity are freed.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

struct Inner {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    buf_len: usize,
}

/// Pool of reusable byte buffers.
///
/// Cloning the pool is cheap; all clones share the same free list.
#[derive(Clone)]
pub struct BytePool {
    inner: Arc<Inner>,
}

impl BytePool {
    /// Create a pool holding at most `capacity` buffers of `buf_len` bytes.
    pub fn new(capacity: usize, buf_len: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                buf_len,
            }),
        }
    }

    /// Borrow a zero-length buffer with at least `buf_len` capacity.
    pub fn take(&self) -> PooledBuf {
        let vec = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buf_len));

        PooledBuf {
            vec,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A buffer on loan from a [`BytePool`], returned on drop.
///
/// Dereferences to `Vec<u8>`; length and contents are the borrower's to
/// manage. An unpooled variant exists for callers that bring their own
/// storage (tests, one-off frames).
pub struct PooledBuf {
    vec: Vec<u8>,
    pool: Weak<Inner>,
}

impl PooledBuf {
    /// Wrap an ordinary vector; dropping it frees the memory normally.
    pub fn unpooled(vec: Vec<u8>) -> Self {
        Self {
            vec,
            pool: Weak::new(),
        }
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.vec
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.vec
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.vec.len())
            .field("pooled", &(self.pool.strong_count() > 0))
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut free = pool.free.lock();
            if free.len() < pool.capacity {
                let mut vec = std::mem::take(&mut self.vec);
                vec.clear();
                free.push(vec);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_return() {
        let pool = BytePool::new(2, 64);
        assert_eq!(pool.idle(), 0);

        {
            let mut buf = pool.take();
            buf.extend_from_slice(b"hello");
            assert_eq!(&buf[..], b"hello");
        }

        // Returned cleared
        assert_eq!(pool.idle(), 1);
        let buf = pool.take();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 5);
    }

    #[test]
    fn test_capacity_bound() {
        let pool = BytePool::new(1, 16);
        let a = pool.take();
        let b = pool.take();
        drop(a);
        drop(b);
        // Second return exceeds capacity and is freed instead
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_unpooled_buffer() {
        let buf = PooledBuf::unpooled(vec![1, 2, 3]);
        assert_eq!(&buf[..], &[1, 2, 3]);
        drop(buf);
    }

    #[test]
    fn test_outlives_pool() {
        let pool = BytePool::new(4, 16);
        let buf = pool.take();
        drop(pool);
        // Pool is gone; drop must not panic
        drop(buf);
    }
}
