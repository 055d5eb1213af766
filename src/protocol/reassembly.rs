//! Reassembly of one inbound message from transport fragments.
//!
//! Uses `bytes::BytesMut` handed over by the owner of the buffer. Tracks the
//! length the header declared, how much has arrived, and the capacity the
//! buffer was granted with. Writes never go past either bound.
//!
//! # Example
//!
//! ```
//! use snep_exchange::protocol::{Progress, Reassembly};
//! use bytes::BytesMut;
//!
//! let mut rx = Reassembly::new(BytesMut::with_capacity(16), 16, 10).unwrap();
//! assert_eq!(rx.push(b"hello").unwrap(), Progress::NeedMore(5));
//! assert_eq!(rx.push(b"world").unwrap(), Progress::Complete);
//! assert_eq!(&rx.into_buffer()[..], b"helloworld");
//! ```

use bytes::BytesMut;

use crate::error::{Result, SnepError};

/// Outcome of pushing bytes into a [`Reassembly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// This many bytes are still expected.
    NeedMore(usize),
    /// Exactly the declared length has arrived.
    Complete,
}

/// Inbound message under reassembly.
#[derive(Debug)]
pub struct Reassembly {
    /// Destination buffer.
    buffer: BytesMut,
    /// Length declared by the message header.
    declared: usize,
    /// Granted capacity of `buffer`.
    capacity: usize,
}

impl Reassembly {
    /// Start reassembling `declared` bytes into `buffer`.
    ///
    /// # Errors
    ///
    /// Returns error if `declared` exceeds `capacity`.
    pub fn new(mut buffer: BytesMut, capacity: usize, declared: usize) -> Result<Self> {
        if declared > capacity {
            return Err(SnepError::Protocol(format!(
                "declared length {} exceeds buffer capacity {}",
                declared, capacity
            )));
        }
        buffer.clear();
        buffer.reserve(declared);
        Ok(Self {
            buffer,
            declared,
            capacity,
        })
    }

    /// Append `data` at the current received offset.
    ///
    /// # Errors
    ///
    /// Returns error if `data` would run past the declared length. Nothing is
    /// written in that case.
    pub fn push(&mut self, data: &[u8]) -> Result<Progress> {
        if data.len() > self.remaining() {
            return Err(SnepError::Protocol(format!(
                "{} bytes delivered with only {} outstanding",
                data.len(),
                self.remaining()
            )));
        }
        self.buffer.extend_from_slice(data);
        Ok(self.progress())
    }

    /// Current progress.
    #[inline]
    pub fn progress(&self) -> Progress {
        match self.remaining() {
            0 => Progress::Complete,
            n => Progress::NeedMore(n),
        }
    }

    /// Bytes received so far.
    #[inline]
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Length declared by the header.
    #[inline]
    pub fn declared(&self) -> usize {
        self.declared
    }

    /// Granted capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still expected.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.declared - self.buffer.len()
    }

    /// True once the declared length has arrived.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Give the buffer back, complete or not.
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx(capacity: usize, declared: usize) -> Reassembly {
        Reassembly::new(BytesMut::with_capacity(capacity), capacity, declared).unwrap()
    }

    #[test]
    fn test_single_push_completes() {
        let mut r = rx(8, 5);
        assert_eq!(r.push(b"hello").unwrap(), Progress::Complete);
        assert!(r.is_complete());
        assert_eq!(&r.into_buffer()[..], b"hello");
    }

    #[test]
    fn test_empty_message_is_complete_immediately() {
        let r = rx(0, 0);
        assert_eq!(r.progress(), Progress::Complete);
    }

    #[test]
    fn test_declared_over_capacity_rejected() {
        let result = Reassembly::new(BytesMut::new(), 10, 11);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds buffer capacity"));
    }

    #[test]
    fn test_byte_at_a_time() {
        let payload = b"fragmented payload";
        let mut r = rx(64, payload.len());

        for (i, byte) in payload.iter().enumerate() {
            let progress = r.push(&[*byte]).unwrap();
            if i + 1 < payload.len() {
                assert_eq!(progress, Progress::NeedMore(payload.len() - i - 1));
            } else {
                assert_eq!(progress, Progress::Complete);
            }
        }
        assert_eq!(&r.into_buffer()[..], payload);
    }

    #[test]
    fn test_overflow_rejected_without_writing() {
        let mut r = rx(8, 4);
        r.push(b"ab").unwrap();

        let result = r.push(b"cde");
        assert!(result.is_err());
        assert_eq!(r.received(), 2);
        assert_eq!(r.progress(), Progress::NeedMore(2));
    }

    #[test]
    fn test_reused_buffer_is_cleared() {
        let mut stale = BytesMut::with_capacity(16);
        stale.extend_from_slice(b"old contents");
        let mut r = Reassembly::new(stale, 16, 3).unwrap();
        assert_eq!(r.received(), 0);
        r.push(b"new").unwrap();
        assert_eq!(&r.into_buffer()[..], b"new");
    }

    #[test]
    fn test_accessors() {
        let r = rx(32, 20);
        assert_eq!(r.declared(), 20);
        assert_eq!(r.capacity(), 32);
        assert_eq!(r.remaining(), 20);
    }
}
