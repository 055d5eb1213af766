//! Bounded pool of receive buffers.
//!
//! Hands out at most `max_buffers` buffers of `buffer_size` bytes at a time.
//! Returned buffers are cleared and kept for reuse, so a steady stream of
//! messages stops allocating once the pool is warm.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;

#[derive(Debug)]
struct PoolState {
    free: Vec<BytesMut>,
    outstanding: usize,
}

/// Fixed-size pool of receive buffers.
#[derive(Debug)]
pub struct BufferPool {
    state: Mutex<PoolState>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Create an empty pool. Buffers are allocated on first use.
    pub fn new(max_buffers: usize, buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(max_buffers),
                outstanding: 0,
            }),
            buffer_size,
            max_buffers,
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capacity of every buffer handed out.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer, or `None` if all of them are out.
    pub fn acquire(&self) -> Option<BytesMut> {
        let mut state = self.state();
        if state.outstanding >= self.max_buffers {
            return None;
        }
        state.outstanding += 1;
        Some(
            state
                .free
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size)),
        )
    }

    /// Give a buffer back. Buffers that shrank below `buffer_size` are
    /// dropped and replaced on the next acquire.
    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut state = self.state();
        state.outstanding = state.outstanding.saturating_sub(1);
        if buffer.capacity() >= self.buffer_size && state.free.len() < self.max_buffers {
            state.free.push(buffer);
        }
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.state().outstanding
    }

    /// Buffers that can still be acquired.
    pub fn available(&self) -> usize {
        self.max_buffers - self.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = BufferPool::new(2, 64);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(a.capacity() >= 64);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_release_reuses_buffer() {
        let pool = BufferPool::new(1, 32);
        let mut buf = pool.acquire().unwrap();
        buf.extend_from_slice(b"payload");
        let ptr = buf.as_ptr();
        pool.release(buf);

        assert_eq!(pool.outstanding(), 0);
        let again = pool.acquire().unwrap();
        assert!(again.is_empty());
        assert_eq!(again.as_ptr(), ptr);
    }

    #[test]
    fn test_shrunken_buffer_not_kept() {
        let pool = BufferPool::new(1, 32);
        let mut buf = pool.acquire().unwrap();
        buf.extend_from_slice(&[0u8; 32]);
        let _tail = buf.split_off(8);
        pool.release(buf);

        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().unwrap().capacity() >= 32);
    }
}
