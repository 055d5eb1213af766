//! Outbound message encoding and fragment slicing.
//!
//! A message is the header, the optional GET acceptable length, and the NDEF
//! payload laid end to end. [`OutboundMessage`] keeps the encoded prefix on
//! the stack and the payload as `bytes::Bytes`, so every fragment after the
//! first is a zero-copy slice of the caller's buffer.
//!
//! # Example
//!
//! ```
//! use snep_exchange::protocol::{OutboundMessage, RequestCode, HEADER_SIZE};
//! use bytes::Bytes;
//!
//! let mut msg = OutboundMessage::new(RequestCode::Put, Bytes::from_static(b"hello world"));
//! assert_eq!(msg.total_len(), HEADER_SIZE + 11);
//!
//! let first = msg.peek_fragment(8);
//! assert_eq!(first.len(), 8);
//! msg.advance(first.len());
//! assert_eq!(msg.remaining(), 9);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{
    encode_accept_length, Header, Opcode, RequestCode, ACCEPT_LENGTH_SIZE, HEADER_SIZE,
};

/// Largest encoded prefix: header plus GET acceptable length.
const MAX_PREFIX: usize = HEADER_SIZE + ACCEPT_LENGTH_SIZE;

/// A message being transmitted, with its send progress.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    prefix: [u8; MAX_PREFIX],
    prefix_len: usize,
    ndef: Bytes,
    sent: usize,
}

impl OutboundMessage {
    /// Message carrying `ndef` as its information.
    pub fn new(opcode: impl Into<Opcode>, ndef: Bytes) -> Self {
        let header = Header::new(opcode, ndef.len() as u32);
        let mut prefix = [0u8; MAX_PREFIX];
        header.encode_into(&mut prefix);
        Self {
            prefix,
            prefix_len: HEADER_SIZE,
            ndef,
            sent: 0,
        }
    }

    /// Header-only message (information length 0).
    pub fn bare(opcode: impl Into<Opcode>) -> Self {
        Self::new(opcode, Bytes::new())
    }

    /// GET request: acceptable length travels between header and payload.
    pub fn get_request(ndef: Bytes, acceptable_length: u32) -> Self {
        let header = Header::new(
            RequestCode::Get,
            (ndef.len() + ACCEPT_LENGTH_SIZE) as u32,
        );
        let mut prefix = [0u8; MAX_PREFIX];
        header.encode_into(&mut prefix);
        prefix[HEADER_SIZE..].copy_from_slice(&encode_accept_length(acceptable_length));
        Self {
            prefix,
            prefix_len: MAX_PREFIX,
            ndef,
            sent: 0,
        }
    }

    /// Replace the version byte of the header.
    pub fn with_version(mut self, version: u8) -> Self {
        self.prefix[0] = version;
        self
    }

    /// Raw opcode byte of this message.
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.prefix[1]
    }

    /// True if there is information after the header.
    #[inline]
    pub fn has_payload(&self) -> bool {
        self.total_len() > HEADER_SIZE
    }

    /// Encoded length of the whole message.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.prefix_len + self.ndef.len()
    }

    /// Bytes already handed to the transport.
    #[inline]
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Bytes not yet handed to the transport.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.total_len() - self.sent
    }

    /// True once every byte has been handed to the transport.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.sent == self.total_len()
    }

    /// The next fragment of at most `max_len` bytes, without advancing.
    ///
    /// The first fragment carries the prefix and is assembled into a fresh
    /// buffer; later fragments are slices of the payload.
    pub fn peek_fragment(&self, max_len: usize) -> Bytes {
        let start = self.sent;
        let end = (start + max_len).min(self.total_len());

        if start >= self.prefix_len {
            return self
                .ndef
                .slice(start - self.prefix_len..end - self.prefix_len);
        }

        let mut buf = BytesMut::with_capacity(end - start);
        buf.extend_from_slice(&self.prefix[start..end.min(self.prefix_len)]);
        if end > self.prefix_len {
            buf.extend_from_slice(&self.ndef[..end - self.prefix_len]);
        }
        buf.freeze()
    }

    /// Record that `n` more bytes were accepted by the transport.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.sent + n <= self.total_len());
        self.sent = (self.sent + n).min(self.total_len());
    }

    /// Give the payload buffer back.
    pub fn into_ndef(self) -> Bytes {
        self.ndef
    }
}

/// Build a complete message as a single byte vector.
///
/// Used for peers that write raw PDUs (tests, bridges).
///
/// # Example
///
/// ```
/// use snep_exchange::protocol::{build_message, Header, ResponseCode};
///
/// let bytes = build_message(&Header::new(ResponseCode::Success, 2), b"hi");
/// assert_eq!(bytes, [0x10, 0x81, 0, 0, 0, 2, b'h', b'i']);
/// ```
pub fn build_message(header: &Header, information: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + information.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(information);
    buf
}
