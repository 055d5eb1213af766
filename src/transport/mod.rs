//! Transport module - the connection-oriented data link the engine runs over.
//!
//! The engine never implements the link itself. It drives any type that
//! implements [`DataLink`] and consumes the [`LinkEvent`]s that link reports,
//! either through [`DataLink::poll_event`] for links that complete
//! synchronously or through the driver's event channel.
//!
//! [`memory::MemoryLink`] is an in-process link pair for tests and demos.

pub mod memory;

use std::fmt;

use bytes::Bytes;

use crate::error::Result;

/// Service access point: a transport endpoint identifier.
pub type Sap = u8;

/// Well-known SAP of the default exchange server.
pub const DEFAULT_SERVER_SAP: Sap = 0x04;

/// Well-known service name of the default exchange server.
pub const DEFAULT_SERVICE_NAME: &str = "urn:nfc:sn:snep";

/// Both endpoints of one data-link connection, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkAddr {
    pub local: Sap,
    pub remote: Sap,
}

impl LinkAddr {
    /// Address of the connection from `local` to `remote`.
    pub fn new(local: Sap, remote: Sap) -> Self {
        Self { local, remote }
    }

    /// The same connection as the peer names it.
    #[inline]
    pub fn mirror(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}<->0x{:02X}", self.local, self.remote)
    }
}

/// Result of handing one PDU to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted.
    Ok,
    /// Accepted, but the link is now congested; hold further PDUs until a
    /// [`LinkEvent::Congestion`] clears it.
    Congested,
    /// Not accepted; the connection is unusable.
    Fail,
}

/// Data read from a connection's receive queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Bytes,
    /// More received bytes remain queued after this read.
    pub more: bool,
}

/// Link-level frame sizes negotiated at activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCapacity {
    /// Largest frame the local side accepts.
    pub local_miu: u16,
    /// Largest frame the peer accepts.
    pub remote_miu: u16,
}

/// Why an outgoing connect did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// No service is registered under the requested name.
    NoService,
    /// The peer refused the connection.
    Rejected,
    /// The link went away while connecting.
    LinkLost,
}

/// Notifications from the data link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A peer connects to a local server SAP.
    ConnectIndication { addr: LinkAddr, miu: u16, rw: u8 },
    /// A local connect was accepted.
    ConnectResponse { addr: LinkAddr, miu: u16, rw: u8 },
    /// A local connect failed.
    ConnectFailed { local: Sap, reason: ConnectFailure },
    /// The peer closed the connection.
    DisconnectIndication { addr: LinkAddr },
    /// A local disconnect completed.
    DisconnectResponse { addr: LinkAddr },
    /// Congestion on the connection changed.
    Congestion { addr: LinkAddr, congested: bool },
    /// The link was activated or deactivated.
    LinkStatus { activated: bool },
    /// Data is waiting in the connection's receive queue.
    Data { addr: LinkAddr },
    /// Everything handed to `send` has been delivered.
    SendComplete { addr: LinkAddr },
}

/// The connection-oriented data link contract consumed by the engine.
pub trait DataLink {
    /// Register a server SAP under `service_name`, preferring `sap_hint`.
    fn register_server(&mut self, sap_hint: Option<Sap>, service_name: &str) -> Result<Sap>;

    /// Register a client SAP.
    fn register_client(&mut self) -> Result<Sap>;

    /// Release a SAP registered by either call above.
    fn deregister(&mut self, sap: Sap);

    /// Start connecting `local` to the service named `service_name`.
    ///
    /// Completion arrives as `ConnectResponse` or `ConnectFailed`, in the
    /// order connects were issued for `local`.
    fn connect(&mut self, local: Sap, service_name: &str) -> Result<()>;

    /// Accept a connection reported by `ConnectIndication`.
    fn accept(&mut self, addr: LinkAddr) -> Result<()>;

    /// Refuse a connection reported by `ConnectIndication`.
    fn reject(&mut self, addr: LinkAddr);

    /// Close a connection. Completion arrives as `DisconnectResponse`.
    fn disconnect(&mut self, addr: LinkAddr, flush: bool);

    /// Hand one PDU to the link.
    fn send(&mut self, addr: LinkAddr, pdu: Bytes) -> SendStatus;

    /// Read up to `max_len` bytes of the oldest received PDU.
    fn read(&mut self, addr: LinkAddr, max_len: usize) -> ReadResult;

    /// Discard everything received but not read. Returns bytes dropped.
    fn flush_unread(&mut self, addr: LinkAddr) -> usize;

    /// Ask for one `SendComplete` once the send queue drains.
    fn set_send_complete_notify(&mut self, addr: LinkAddr);

    /// Link-level frame sizes.
    fn link_capacity(&self) -> LinkCapacity;

    /// Next queued notification, for links that complete synchronously.
    fn poll_event(&mut self) -> Option<LinkEvent> {
        None
    }
}
