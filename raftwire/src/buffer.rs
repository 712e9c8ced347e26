//! Pooled connection buffers.
//!
//! Every connection frames packets through a fixed-capacity buffer rented
//! from a shared [`BufferPool`] and returned on disconnect. Buffers never
//! grow: a payload that does not fit is a framing error, not a reallocation.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared pool of fixed-capacity byte buffers.
///
/// The lock is only held for a push or pop, never across an await point.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool handing out buffers of `capacity` bytes.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Rent a buffer, reusing a previously released one when available.
    pub fn rent(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = reused.unwrap_or_else(|| vec![0u8; self.capacity]);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Capacity of every buffer in this pool.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// Number of released buffers currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, buf: Vec<u8>) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf);
    }
}

/// A buffer rented from a [`BufferPool`], returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.len() == self.pool.capacity {
            self.pool.release(buf);
        }
    }
}
