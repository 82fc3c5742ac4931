//! Process-global byte-buffer pool for the scan hot path.
//!
//! Every pipeline run checks buffers out of one shared pool and works in
//! them across entries instead of allocating per row. Leases return their
//! buffer on drop, so every exit path (including panics) hands the memory
//! back.
//!
//! A lease holder may grow its buffer freely; growth reallocates the backing
//! store, so any recorded spans against the old bytes are stale and must be
//! re-derived. Buffers grown past `MAX_POOLED_CAPACITY` are dropped at
//! return time rather than pooled.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Initial capacity of a freshly allocated pool buffer, sized for typical
/// secondary-key entries.
const DEFAULT_BUF_CAPACITY: usize = 16 * 1024;

/// Buffers grown beyond this are not returned to the pool.
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Upper bound on idle buffers retained by the pool.
const MAX_POOLED_BUFFERS: usize = 64;

static SEC_KEY_BUF_POOL: OnceLock<BufPool> = OnceLock::new();

/// The process-global pool used by all scan pipelines.
pub fn sec_key_buf_pool() -> &'static BufPool {
    SEC_KEY_BUF_POOL.get_or_init(BufPool::new)
}

/// A concurrent stack of reusable byte buffers.
pub struct BufPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufPool {
    fn new() -> Self {
        Self {
            bufs: Mutex::new(Vec::new()),
        }
    }

    /// Check a buffer out of the pool. The buffer is empty but keeps
    /// whatever capacity it had when last returned.
    pub fn checkout(&'static self) -> BufLease {
        let buf = self
            .bufs
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(DEFAULT_BUF_CAPACITY));
        BufLease {
            buf: Some(buf),
            pool: self,
        }
    }

    fn put_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut bufs = self.bufs.lock().expect("buffer pool poisoned");
        if bufs.len() < MAX_POOLED_BUFFERS {
            bufs.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.bufs.lock().expect("buffer pool poisoned").len()
    }
}

/// RAII checkout of one pool buffer; derefs to the underlying `Vec<u8>`.
pub struct BufLease {
    buf: Option<Vec<u8>>,
    pool: &'static BufPool,
}

impl Deref for BufLease {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("lease already returned")
    }
}

impl DerefMut for BufLease {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("lease already returned")
    }
}

impl Drop for BufLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_leases_return_their_buffers() {
        let pool = sec_key_buf_pool();
        {
            let mut lease = pool.checkout();
            lease.extend_from_slice(b"some scan bytes");
        }
        // Other tests share the global pool, so only monotonicity is checked.
        assert!(pool.idle() >= 1);
        let lease = pool.checkout();
        // Reused buffers come back empty.
        assert!(lease.is_empty());
    }

    #[test]
    fn oversized_buffers_are_not_pooled() {
        let pool = sec_key_buf_pool();
        {
            let mut lease = pool.checkout();
            lease.reserve(MAX_POOLED_CAPACITY + 1);
        }
        let lease = pool.checkout();
        assert!(lease.capacity() <= MAX_POOLED_CAPACITY);
    }

    #[test]
    fn concurrent_checkouts_get_distinct_buffers() {
        let pool = sec_key_buf_pool();
        let mut a = pool.checkout();
        let mut b = pool.checkout();
        a.push(1);
        b.push(2);
        assert_eq!(a[0], 1);
        assert_eq!(b[0], 2);
    }
}
