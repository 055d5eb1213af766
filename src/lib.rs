//! # snep-exchange
//!
//! Fragmenting request/response engine for exchanging NDEF messages over a
//! connection-oriented, MTU-limited data link.
//!
//! Clients send GET or PUT requests; servers answer with a response code and,
//! for GET, a message. Messages larger than the negotiated fragment size are
//! split, and the receiver grants the rest with a single CONTINUE (or refuses
//! it with REJECT).
//!
//! ## Architecture
//!
//! - **Engine** ([`engine`]): synchronous state machine. API calls validate
//!   and enqueue; [`Engine::run_pending`] executes them, consumes link
//!   events and delivers [`ExchangeEvent`]s to handlers.
//! - **Driver** ([`driver`]): runs an engine inside one tokio task behind a
//!   cloneable [`EngineHandle`].
//! - **Data link** ([`transport`]): the [`DataLink`] trait the engine sits
//!   on, plus an in-memory pair for tests and demos.
//! - **Gateway** ([`gateway`]): the well-known default server, forwarding
//!   received messages to a dispatcher.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use snep_exchange::{EngineBuilder, ExchangeApi, ExchangeEvent, ChannelHandler};
//! use snep_exchange::transport::memory::MemoryLink;
//! use snep_exchange::transport::DEFAULT_SERVICE_NAME;
//!
//! let (a, b) = MemoryLink::pair();
//! a.set_link_active(true);
//! let mut server = EngineBuilder::new().build(a).unwrap();
//! let mut client = EngineBuilder::new().build(b).unwrap();
//!
//! let (server_handler, mut server_events) = ChannelHandler::new(16, 1024);
//! let (client_handler, mut client_events) = ChannelHandler::new(16, 1024);
//! server.register_server(Some(0x04), DEFAULT_SERVICE_NAME, Arc::new(server_handler)).unwrap();
//! let registration = client.register_client(Arc::new(client_handler)).unwrap();
//! server.run_pending();
//! client.run_pending();
//!
//! let connection = client.connect(registration, DEFAULT_SERVICE_NAME).unwrap();
//! for _ in 0..4 {
//!     client.run_pending();
//!     server.run_pending();
//! }
//! client.send_put_request(connection, Bytes::from_static(b"hello")).unwrap();
//! client.run_pending();
//! server.run_pending();
//!
//! let received = std::iter::from_fn(|| server_events.try_recv().ok())
//!     .any(|e| matches!(e, ExchangeEvent::PutRequest { ndef, .. } if &ndef[..] == b"hello"));
//! assert!(received);
//! # drop(client_events);
//! ```

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod protocol;
pub mod transport;

pub use config::EngineConfig;
pub use driver::{spawn_engine, EngineHandle};
pub use engine::{Engine, EngineBuilder, ExchangeApi, Handle, Lifecycle};
pub use error::{Result, SnepError};
pub use gateway::{DefaultServer, GatewayConfig, NdefDispatcher};
pub use handler::{
    Allocation, ChannelHandler, ExchangeEvent, ExchangeHandler, Reclaimed, SharedHandler,
};
pub use protocol::{RequestCode, ResponseCode, Role};
pub use transport::{DataLink, LinkAddr, LinkEvent, Sap};
