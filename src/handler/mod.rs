//! Handler module - the application side of the engine.
//!
//! Provides:
//! - [`ExchangeHandler`] - receives [`ExchangeEvent`]s and answers buffer
//!   allocation requests
//! - [`ExchangeEvent`] - everything the engine reports to an application
//! - [`ChannelHandler`] - forwards events into a tokio channel
//!
//! Handlers are shared (`Arc`) between a registration and every connection
//! spawned from it. Events are delivered after the engine has finished
//! mutating state, together with a `&mut dyn ExchangeApi` through which the
//! handler may post further calls.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use snep_exchange::engine::{ExchangeApi, Handle};
//! use snep_exchange::handler::{Allocation, ExchangeEvent, ExchangeHandler};
//! use snep_exchange::protocol::{RequestCode, ResponseCode};
//!
//! /// Answers every GET with a fixed record and accepts every PUT.
//! struct Static;
//!
//! impl ExchangeHandler for Static {
//!     fn on_event(&self, event: ExchangeEvent, api: &mut dyn ExchangeApi) {
//!         match event {
//!             ExchangeEvent::GetRequest { connection, .. } => {
//!                 let _ = api.send_get_response(
//!                     connection,
//!                     ResponseCode::Success,
//!                     Bytes::from_static(b"\xD1\x01\x01T"),
//!                 );
//!             }
//!             ExchangeEvent::PutRequest { connection, .. } => {
//!                 let _ = api.send_put_response(connection, ResponseCode::Success);
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     fn allocate(&self, _: Handle, _: RequestCode, declared_len: usize) -> Allocation {
//!         Allocation::granted(declared_len)
//!     }
//! }
//!
//! let handler: Arc<dyn ExchangeHandler> = Arc::new(Static);
//! ```

mod channel;

pub use channel::ChannelHandler;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::engine::{ExchangeApi, Handle};
use crate::protocol::{RequestCode, ResponseCode, Role};

/// Handler shared between a registration and its connections.
pub type SharedHandler = Arc<dyn ExchangeHandler>;

/// Application callback contract.
pub trait ExchangeHandler: Send + Sync + 'static {
    /// Receive one event. Any call made through `api` is queued and runs
    /// after this method returns.
    fn on_event(&self, event: ExchangeEvent, api: &mut dyn ExchangeApi);

    /// Provide a receive buffer for an inbound message of `declared_len`
    /// bytes. Called only on server connections.
    ///
    /// The default declines every request.
    fn allocate(&self, connection: Handle, request: RequestCode, declared_len: usize) -> Allocation {
        let _ = (connection, request, declared_len);
        Allocation::declined()
    }
}

/// Answer to a buffer allocation request.
#[derive(Debug)]
pub enum Allocation {
    /// Reassemble into `buffer`, up to `capacity` bytes.
    Granted { buffer: BytesMut, capacity: usize },
    /// Refuse the message. `code` overrides the reply the engine picks.
    Declined { code: Option<ResponseCode> },
}

impl Allocation {
    /// Grant a fresh buffer of `capacity` bytes.
    pub fn granted(capacity: usize) -> Self {
        Self::Granted {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Decline and let the engine pick the reply code.
    pub fn declined() -> Self {
        Self::Declined { code: None }
    }

    /// Decline with an explicit reply code.
    pub fn declined_with(code: ResponseCode) -> Self {
        Self::Declined { code: Some(code) }
    }
}

/// Buffers handed back when a connection goes away.
#[derive(Debug, Default)]
pub struct Reclaimed {
    /// Payload of an outbound message that had not finished.
    pub outbound: Option<Bytes>,
    /// Partially reassembled inbound message.
    pub inbound: Option<BytesMut>,
}

impl Reclaimed {
    /// True if nothing was outstanding.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_none() && self.inbound.is_none()
    }
}

/// Events reported to an application.
#[derive(Debug)]
pub enum ExchangeEvent {
    /// A registration was accepted by the data link.
    Registered {
        registration: Handle,
        /// Echoed for servers.
        service_name: Option<String>,
    },
    /// The data link refused a registration. The handle is no longer valid.
    RegistrationFailed { registration: Handle, reason: String },
    /// The link came up. Clients may connect from now on.
    LinkActivated { registration: Handle },
    /// The link went down. Every connection has already been torn down.
    LinkDeactivated { registration: Handle },
    /// A connection was established.
    Connected {
        registration: Handle,
        connection: Handle,
        role: Role,
    },
    /// A peer's GET request, reassembled.
    GetRequest {
        connection: Handle,
        acceptable_length: u32,
        ndef: BytesMut,
    },
    /// A peer's PUT request, reassembled.
    PutRequest { connection: Handle, ndef: BytesMut },
    /// Outcome of a local GET request. `ndef` is empty unless `code` is
    /// `Success`.
    GetResponse {
        connection: Handle,
        code: ResponseCode,
        ndef: BytesMut,
    },
    /// Outcome of a local PUT request.
    PutResponse {
        connection: Handle,
        code: ResponseCode,
    },
    /// A GET response was delivered or aborted by the peer; its buffer is
    /// returned.
    GetResponseSendComplete { connection: Handle, buffer: Bytes },
    /// The connection is gone. Sent exactly once per connection.
    Disconnected {
        connection: Handle,
        reclaimed: Reclaimed,
    },
}

impl ExchangeEvent {
    /// Event name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::RegistrationFailed { .. } => "registration_failed",
            Self::LinkActivated { .. } => "link_activated",
            Self::LinkDeactivated { .. } => "link_deactivated",
            Self::Connected { .. } => "connected",
            Self::GetRequest { .. } => "get_request",
            Self::PutRequest { .. } => "put_request",
            Self::GetResponse { .. } => "get_response",
            Self::PutResponse { .. } => "put_response",
            Self::GetResponseSendComplete { .. } => "get_response_send_complete",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}
