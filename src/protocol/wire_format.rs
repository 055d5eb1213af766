//! Wire format encoding and decoding.
//!
//! Implements the 6-byte message header:
//! ```text
//! ┌─────────┬────────┬────────────────────┐
//! │ Version │ Opcode │ Information length │
//! │ 1 byte  │ 1 byte │ 4 bytes            │
//! │ maj.min │        │ uint32 BE          │
//! └─────────┴────────┴────────────────────┘
//! ```
//!
//! A GET request carries a 4-byte big-endian acceptable length right after
//! the header. It is counted inside the information length.

use std::fmt;

use crate::error::{Result, SnepError};

/// Header size in bytes (fixed, exactly 6).
pub const HEADER_SIZE: usize = 6;

/// Size of the acceptable-length field carried by GET requests.
pub const ACCEPT_LENGTH_SIZE: usize = 4;

/// Local protocol version (1.0).
pub const VERSION: u8 = 0x10;

/// Mask selecting the major version nibble.
pub const MAJOR_VERSION_MASK: u8 = 0xF0;

/// Top bit of the opcode byte: set for responses.
pub const RESPONSE_BIT: u8 = 0x80;

/// Request codes (top bit clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestCode {
    /// Send the remaining fragments.
    Continue = 0x00,
    /// Return an NDEF message.
    Get = 0x01,
    /// Accept an NDEF message.
    Put = 0x02,
    /// Do not send remaining fragments.
    Reject = 0x7F,
}

impl RequestCode {
    /// Parse a request opcode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Continue),
            0x01 => Some(Self::Get),
            0x02 => Some(Self::Put),
            0x7F => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Response codes (top bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    /// Continue sending remaining fragments.
    Continue = 0x80,
    /// Operation succeeded.
    Success = 0x81,
    /// Resource not found.
    NotFound = 0xC0,
    /// Resource exceeds the acceptable length.
    ExcessData = 0xC1,
    /// Malformed request.
    BadRequest = 0xC2,
    /// Unsupported functionality requested.
    NotImplemented = 0xE0,
    /// Unsupported protocol version.
    UnsupportedVersion = 0xE1,
    /// Do not send remaining fragments.
    Reject = 0xFF,
}

impl ResponseCode {
    /// Parse a response opcode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Self::Continue),
            0x81 => Some(Self::Success),
            0xC0 => Some(Self::NotFound),
            0xC1 => Some(Self::ExcessData),
            0xC2 => Some(Self::BadRequest),
            0xE0 => Some(Self::NotImplemented),
            0xE1 => Some(Self::UnsupportedVersion),
            0xFF => Some(Self::Reject),
            _ => None,
        }
    }

    /// Response codes an application may answer a request with.
    ///
    /// `Continue` is engine-internal and never accepted from the API.
    #[inline]
    pub fn is_final(self) -> bool {
        self != Self::Continue
    }
}

/// A decoded opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Request(RequestCode),
    Response(ResponseCode),
}

impl Opcode {
    /// Raw opcode byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Request(code) => code as u8,
            Self::Response(code) => code as u8,
        }
    }
}

impl From<RequestCode> for Opcode {
    fn from(code: RequestCode) -> Self {
        Self::Request(code)
    }
}

impl From<ResponseCode> for Opcode {
    fn from(code: ResponseCode) -> Self {
        Self::Response(code)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(code) => write!(f, "{code:?} request (0x{:02X})", *code as u8),
            Self::Response(code) => write!(f, "{code:?} response (0x{:02X})", *code as u8),
        }
    }
}

/// Which end of an exchange a record plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Answers GET and PUT requests.
    Server,
    /// Issues GET and PUT requests.
    Client,
}

/// Reasons an inbound header is refused, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Major version differs from the local one. The message is dropped,
    /// the connection survives.
    UnsupportedVersion(u8),
    /// A server saw a response opcode or a client saw a request opcode.
    WrongDirection(u8),
    /// Opcode is in the right class but is not defined.
    NotImplemented(u8),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "unsupported version 0x{v:02X}"),
            Self::WrongDirection(op) => write!(f, "opcode 0x{op:02X} illegal for this role"),
            Self::NotImplemented(op) => write!(f, "opcode 0x{op:02X} not implemented"),
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Version byte (high nibble major, low nibble minor).
    pub version: u8,
    /// Raw opcode byte.
    pub opcode: u8,
    /// Bytes following the header, including the GET acceptable length.
    pub information_length: u32,
}

impl Header {
    /// Create a header at the local protocol version.
    pub fn new(opcode: impl Into<Opcode>, information_length: u32) -> Self {
        Self {
            version: VERSION,
            opcode: opcode.into().as_u8(),
            information_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use snep_exchange::protocol::{Header, RequestCode};
    ///
    /// let bytes = Header::new(RequestCode::Put, 5).encode();
    /// assert_eq!(bytes, [0x10, 0x02, 0, 0, 0, 5]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (6 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.version;
        buf[1] = self.opcode;
        buf[2..6].copy_from_slice(&self.information_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: buf[0],
            opcode: buf[1],
            information_length: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }

    /// Major version nibble.
    #[inline]
    pub fn major_version(&self) -> u8 {
        self.version & MAJOR_VERSION_MASK
    }

    /// True if the opcode byte has the response bit set.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.opcode & RESPONSE_BIT != 0
    }

    /// Validate an inbound header against the receiving record's role.
    ///
    /// Checks, in order:
    /// - major version equals `local_version`'s major version
    /// - opcode class matches the role (servers take requests, clients
    ///   take responses)
    /// - opcode is defined
    pub fn validate_for(&self, role: Role, local_version: u8) -> std::result::Result<Opcode, Violation> {
        if self.major_version() != local_version & MAJOR_VERSION_MASK {
            return Err(Violation::UnsupportedVersion(self.version));
        }

        match (role, self.is_response()) {
            (Role::Server, true) | (Role::Client, false) => {
                Err(Violation::WrongDirection(self.opcode))
            }
            (Role::Server, false) => RequestCode::from_u8(self.opcode)
                .map(Opcode::Request)
                .ok_or(Violation::NotImplemented(self.opcode)),
            (Role::Client, true) => ResponseCode::from_u8(self.opcode)
                .map(Opcode::Response)
                .ok_or(Violation::NotImplemented(self.opcode)),
        }
    }
}

/// Encode a GET request's acceptable-length field.
#[inline]
pub fn encode_accept_length(acceptable_length: u32) -> [u8; ACCEPT_LENGTH_SIZE] {
    acceptable_length.to_be_bytes()
}

/// Decode a GET request's acceptable-length field.
pub fn decode_accept_length(buf: &[u8]) -> Result<u32> {
    if buf.len() < ACCEPT_LENGTH_SIZE {
        return Err(SnepError::Protocol(format!(
            "acceptable length needs {} bytes, got {}",
            ACCEPT_LENGTH_SIZE,
            buf.len()
        )));
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_REQUESTS: [RequestCode; 4] = [
        RequestCode::Continue,
        RequestCode::Get,
        RequestCode::Put,
        RequestCode::Reject,
    ];

    const ALL_RESPONSES: [ResponseCode; 8] = [
        ResponseCode::Continue,
        ResponseCode::Success,
        ResponseCode::NotFound,
        ResponseCode::ExcessData,
        ResponseCode::BadRequest,
        ResponseCode::NotImplemented,
        ResponseCode::UnsupportedVersion,
        ResponseCode::Reject,
    ];

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(ResponseCode::Success, 0x01020304);
        let bytes = header.encode();

        assert_eq!(bytes[0], VERSION);
        assert_eq!(bytes[1], 0x81);
        assert_eq!(&bytes[2..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0x10u8, 0x02, 0, 0, 0];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_decode_reads_fields() {
        let header = Header::decode(&[0x12, 0x01, 0, 0, 0x01, 0x00]).unwrap();
        assert_eq!(header.version, 0x12);
        assert_eq!(header.major_version(), 0x10);
        assert_eq!(header.opcode, 0x01);
        assert_eq!(header.information_length, 256);
    }

    #[test]
    fn test_opcode_classes_split_on_top_bit() {
        for code in ALL_REQUESTS {
            assert_eq!(code as u8 & RESPONSE_BIT, 0, "{code:?}");
            assert_eq!(RequestCode::from_u8(code as u8), Some(code));
        }
        for code in ALL_RESPONSES {
            assert_ne!(code as u8 & RESPONSE_BIT, 0, "{code:?}");
            assert_eq!(ResponseCode::from_u8(code as u8), Some(code));
        }
    }

    #[test]
    fn test_minor_version_difference_accepted() {
        let header = Header {
            version: 0x1F,
            opcode: RequestCode::Put as u8,
            information_length: 0,
        };
        assert_eq!(
            header.validate_for(Role::Server, VERSION),
            Ok(Opcode::Request(RequestCode::Put))
        );
    }

    #[test]
    fn test_major_version_checked_before_opcode() {
        // Every opcode byte, for both roles, must fail on version first.
        for opcode in 0..=u8::MAX {
            let header = Header {
                version: 0x20,
                opcode,
                information_length: 0,
            };
            for role in [Role::Server, Role::Client] {
                assert_eq!(
                    header.validate_for(role, VERSION),
                    Err(Violation::UnsupportedVersion(0x20))
                );
            }
        }
    }

    #[test]
    fn test_server_rejects_every_response_class_opcode() {
        for opcode in 0x80..=u8::MAX {
            let header = Header {
                version: VERSION,
                opcode,
                information_length: 0,
            };
            assert_eq!(
                header.validate_for(Role::Server, VERSION),
                Err(Violation::WrongDirection(opcode))
            );
        }
    }

    #[test]
    fn test_client_rejects_every_request_class_opcode() {
        for opcode in 0x00..0x80 {
            let header = Header {
                version: VERSION,
                opcode,
                information_length: 0,
            };
            assert_eq!(
                header.validate_for(Role::Client, VERSION),
                Err(Violation::WrongDirection(opcode))
            );
        }
    }

    #[test]
    fn test_undefined_opcodes_not_implemented() {
        let server = Header {
            version: VERSION,
            opcode: 0x05,
            information_length: 0,
        };
        assert_eq!(
            server.validate_for(Role::Server, VERSION),
            Err(Violation::NotImplemented(0x05))
        );

        let client = Header {
            version: VERSION,
            opcode: 0x90,
            information_length: 0,
        };
        assert_eq!(
            client.validate_for(Role::Client, VERSION),
            Err(Violation::NotImplemented(0x90))
        );
    }

    #[test]
    fn test_accept_length_field() {
        assert_eq!(encode_accept_length(1024), [0, 0, 0x04, 0]);
        assert_eq!(decode_accept_length(&[0, 0, 0x04, 0, 0xAA]).unwrap(), 1024);
        assert!(decode_accept_length(&[0, 1]).is_err());
    }

    #[test]
    fn test_opcode_display() {
        let op = Opcode::from(ResponseCode::NotFound);
        assert_eq!(op.to_string(), "NotFound response (0xC0)");
    }
}
