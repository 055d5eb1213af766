//! Protocol module - wire format, fragmentation, reassembly and MIU choice.
//!
//! This module implements the binary side of the exchange protocol:
//! - 6-byte header encoding/decoding and role validation
//! - Outbound message slicing into transport fragments
//! - Inbound reassembly bookkeeping
//! - Efficient fragment size from peer link parameters

mod frame;
mod miu;
mod reassembly;
mod wire_format;

pub use frame::{build_message, OutboundMessage};
pub use miu::{efficient_miu, AGGREGATION_OVERHEAD, FRAGMENT_OVERHEAD};
pub use reassembly::{Progress, Reassembly};
pub use wire_format::{
    decode_accept_length, encode_accept_length, Header, Opcode, RequestCode, ResponseCode, Role,
    Violation, ACCEPT_LENGTH_SIZE, HEADER_SIZE, MAJOR_VERSION_MASK, RESPONSE_BIT, VERSION,
};
