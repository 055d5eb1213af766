//! Engine module - the per-connection exchange state machine.
//!
//! [`Engine`] owns the record arena, the data link and two queues:
//! - an inbox of posted calls, filled by [`ExchangeApi`] methods after they
//!   validate synchronously
//! - an outbox of events, delivered to handlers once the state they
//!   describe has been applied
//!
//! Nothing runs until [`Engine::run_pending`] (or one of the entry points
//! that call it) is invoked, so calls made from inside a handler are queued
//! behind the current step instead of re-entering it. Everything is
//! single-threaded; [`driver`](crate::driver) moves an engine into one tokio
//! task when async operation is wanted.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use snep_exchange::engine::{EngineBuilder, ExchangeApi};
//! use snep_exchange::handler::ChannelHandler;
//! use snep_exchange::transport::memory::MemoryLink;
//! use snep_exchange::transport::DEFAULT_SERVICE_NAME;
//!
//! let (link, _peer) = MemoryLink::pair();
//! let mut engine = EngineBuilder::new().max_connections(4).build(link).unwrap();
//!
//! let (handler, mut events) = ChannelHandler::new(16, 1024);
//! let server = engine
//!     .register_server(Some(0x04), DEFAULT_SERVICE_NAME, Arc::new(handler))
//!     .unwrap();
//! engine.run_pending();
//!
//! assert!(events.try_recv().is_ok()); // Registered
//! assert!(engine.lifecycle(server).is_some());
//! ```

mod control;
mod receive;
mod registry;
mod transmit;

pub use registry::{Handle, Lifecycle, Side};

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::{Result, SnepError};
use crate::handler::{ExchangeEvent, SharedHandler};
use crate::protocol::{OutboundMessage, RequestCode, ResponseCode, Role};
use crate::transport::{DataLink, LinkEvent, Sap};
use registry::{Connection, Exchange, Record, Registration, Registry};

/// Calls an application makes on an engine.
///
/// Every method validates its handle, role and lifecycle before anything is
/// queued. A failed call posts nothing.
pub trait ExchangeApi {
    /// Register a server under `service_name`, preferring SAP `sap_hint`.
    ///
    /// The outcome arrives as `Registered` or `RegistrationFailed`.
    fn register_server(
        &mut self,
        sap_hint: Option<Sap>,
        service_name: &str,
        handler: SharedHandler,
    ) -> Result<Handle>;

    /// Register a client template. Connections are spawned from it with
    /// [`connect`](Self::connect).
    fn register_client(&mut self, handler: SharedHandler) -> Result<Handle>;

    /// Tear down a registration and every connection spawned from it.
    fn deregister(&mut self, registration: Handle) -> Result<()>;

    /// Connect a client registration to the service named `service_name`.
    ///
    /// Returns the new connection's handle. Requires an active link and a
    /// completed registration.
    fn connect(&mut self, client: Handle, service_name: &str) -> Result<Handle>;

    /// Send a GET request carrying `request`. The response is reassembled
    /// into a buffer of `capacity` bytes; anything longer than
    /// `acceptable_length` is refused with `ExcessData`.
    fn send_get_request(
        &mut self,
        connection: Handle,
        request: Bytes,
        capacity: usize,
        acceptable_length: u32,
    ) -> Result<()>;

    /// Send a PUT request carrying `ndef`.
    fn send_put_request(&mut self, connection: Handle, ndef: Bytes) -> Result<()>;

    /// Answer a GET request. `ndef` must be empty unless `code` is `Success`.
    fn send_get_response(&mut self, connection: Handle, code: ResponseCode, ndef: Bytes)
        -> Result<()>;

    /// Answer a PUT request.
    fn send_put_response(&mut self, connection: Handle, code: ResponseCode) -> Result<()>;

    /// Close a connection. A second call on the same handle fails with
    /// `InvalidHandle`.
    fn disconnect(&mut self, connection: Handle, flush: bool) -> Result<()>;
}

/// Work posted to the engine's inbox.
#[derive(Debug)]
enum Message {
    RegisterServer {
        registration: Handle,
        sap_hint: Option<Sap>,
        service_name: String,
    },
    RegisterClient {
        registration: Handle,
    },
    Deregister {
        registration: Handle,
    },
    Connect {
        connection: Handle,
        service_name: String,
    },
    Send {
        connection: Handle,
        message: OutboundMessage,
        get_response: bool,
    },
    Disconnect {
        connection: Handle,
        flush: bool,
    },
}

/// Builder for an [`Engine`].
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Set the record arena size.
    ///
    /// Default: 6
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the response timer.
    ///
    /// Default: 1 second
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the protocol version byte.
    ///
    /// Default: 0x10
    pub fn version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    /// Set the driver's command channel capacity.
    ///
    /// Default: 64
    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.config.command_capacity = capacity;
        self
    }

    /// Set how often a driven engine re-polls its link.
    ///
    /// Default: 10 ms
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Validate the configuration and build an engine over `link`.
    pub fn build<L: DataLink>(self, link: L) -> Result<Engine<L>> {
        Engine::new(link, self.config)
    }
}

/// The exchange engine.
pub struct Engine<L: DataLink> {
    link: L,
    config: EngineConfig,
    registry: Registry,
    inbox: VecDeque<Message>,
    outbox: VecDeque<(SharedHandler, ExchangeEvent)>,
    link_active: bool,
}

impl<L: DataLink> Engine<L> {
    /// Create an engine over `link`.
    pub fn new(link: L, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            link,
            registry: Registry::with_capacity(config.max_connections),
            config,
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            link_active: false,
        })
    }

    /// Configuration the engine was built with.
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The data link the engine sits on.
    #[inline]
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutable access to the data link. Traffic sent here bypasses the
    /// engine's bookkeeping.
    #[inline]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// True once the link reported activation.
    #[inline]
    pub fn is_link_active(&self) -> bool {
        self.link_active
    }

    /// Lifecycle of the record behind `handle`, if it is live.
    pub fn lifecycle(&self, handle: Handle) -> Option<Lifecycle> {
        match self.registry.get(handle)? {
            Record::Registration(_) => Some(Lifecycle::Registered),
            Record::Connection(c) => Some(c.lifecycle),
        }
    }

    /// Role of the record behind `handle`, if it is live.
    pub fn role(&self, handle: Handle) -> Option<Role> {
        match self.registry.get(handle)? {
            Record::Registration(r) => Some(r.role),
            Record::Connection(c) => Some(c.role),
        }
    }

    /// Fragment size negotiated for a connected connection.
    pub fn negotiated_miu(&self, connection: Handle) -> Option<usize> {
        self.registry
            .connection(connection)
            .filter(|c| c.lifecycle != Lifecycle::Connecting)
            .map(|c| c.miu)
    }

    /// Which side of a fragmented transfer is paused for a CONTINUE.
    pub fn awaiting_continue(&self, connection: Handle) -> Option<Side> {
        self.registry.connection(connection)?.awaiting_continue
    }

    /// True while the link reported congestion for the connection.
    pub fn is_congested(&self, connection: Handle) -> bool {
        self.registry
            .connection(connection)
            .is_some_and(|c| c.congested)
    }

    /// Number of live records.
    pub fn record_count(&self) -> usize {
        self.registry.len()
    }

    /// Size of the record arena.
    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }

    /// True if calls or events are waiting for [`run_pending`](Self::run_pending).
    pub fn has_pending(&self) -> bool {
        !self.inbox.is_empty() || !self.outbox.is_empty()
    }

    /// Earliest armed response timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry
            .connections()
            .into_iter()
            .filter_map(|h| self.registry.connection(h)?.response_deadline)
            .min()
    }

    /// Execute queued calls, poll the link and deliver events until all
    /// three are exhausted.
    pub fn run_pending(&mut self) {
        loop {
            if let Some((handler, event)) = self.outbox.pop_front() {
                trace!(event = event.name(), "Delivering event");
                handler.on_event(event, self);
                continue;
            }
            if let Some(message) = self.inbox.pop_front() {
                self.execute(message);
                continue;
            }
            match self.link.poll_event() {
                Some(event) => self.process_link_event(event),
                None => break,
            }
        }
    }

    /// Feed one event from the data link and run everything it causes.
    pub fn on_link_event(&mut self, event: LinkEvent) {
        self.process_link_event(event);
        self.run_pending();
    }

    /// Fire every response timer due at `now`, then run pending work.
    pub fn handle_timeouts(&mut self, now: Instant) {
        for handle in self.registry.connections() {
            let due = self
                .registry
                .connection(handle)
                .and_then(|c| c.response_deadline)
                .is_some_and(|deadline| deadline <= now);
            if due {
                self.on_response_timeout(handle);
            }
        }
        self.run_pending();
    }

    fn post(&mut self, message: Message) {
        trace!(?message, "Posting");
        self.inbox.push_back(message);
    }

    fn emit(&mut self, handler: SharedHandler, event: ExchangeEvent) {
        self.outbox.push_back((handler, event));
    }

    fn execute(&mut self, message: Message) {
        match message {
            Message::RegisterServer {
                registration,
                sap_hint,
                service_name,
            } => self.execute_register_server(registration, sap_hint, service_name),
            Message::RegisterClient { registration } => self.execute_register_client(registration),
            Message::Deregister { registration } => self.execute_deregister(registration),
            Message::Connect {
                connection,
                service_name,
            } => self.execute_connect(connection, &service_name),
            Message::Send {
                connection,
                message,
                get_response,
            } => {
                let live = self
                    .registry
                    .connection(connection)
                    .is_some_and(|c| c.lifecycle == Lifecycle::Connected);
                if live {
                    self.transmit(connection, message, get_response);
                } else {
                    debug!(%connection, "Dropping send for closed connection");
                }
            }
            Message::Disconnect { connection, flush } => {
                self.execute_disconnect(connection, flush)
            }
        }
    }

    /// Connection record that must be connected, for an API call.
    fn connected(&mut self, handle: Handle, role: Role) -> Result<&mut Connection> {
        let conn = self
            .registry
            .connection_mut(handle)
            .ok_or(SnepError::InvalidHandle)?;
        if conn.role != role {
            return Err(SnepError::InvalidState(match role {
                Role::Client => "call requires a client connection",
                Role::Server => "call requires a server connection",
            }));
        }
        match conn.lifecycle {
            Lifecycle::Connected => Ok(conn),
            Lifecycle::Disconnecting => Err(SnepError::InvalidHandle),
            _ => Err(SnepError::InvalidState("connection is not connected")),
        }
    }

    /// Client connection free to start a request.
    fn idle_client(&mut self, handle: Handle) -> Result<&mut Connection> {
        let conn = self.connected(handle, Role::Client)?;
        if conn.exchange != Exchange::Idle || conn.is_busy() {
            return Err(SnepError::InvalidState("a request is already in progress"));
        }
        Ok(conn)
    }
}

impl<L: DataLink> ExchangeApi for Engine<L> {
    fn register_server(
        &mut self,
        sap_hint: Option<Sap>,
        service_name: &str,
        handler: SharedHandler,
    ) -> Result<Handle> {
        if service_name.is_empty() {
            return Err(SnepError::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }
        let registration = self.registry.insert(Record::Registration(Registration {
            sap: None,
            role: Role::Server,
            handler,
            deregistering: false,
            stale_connects: 0,
        }))?;
        self.post(Message::RegisterServer {
            registration,
            sap_hint,
            service_name: service_name.to_string(),
        });
        Ok(registration)
    }

    fn register_client(&mut self, handler: SharedHandler) -> Result<Handle> {
        let registration = self.registry.insert(Record::Registration(Registration {
            sap: None,
            role: Role::Client,
            handler,
            deregistering: false,
            stale_connects: 0,
        }))?;
        self.post(Message::RegisterClient { registration });
        Ok(registration)
    }

    fn deregister(&mut self, registration: Handle) -> Result<()> {
        let record = self
            .registry
            .registration_mut(registration)
            .ok_or(SnepError::InvalidHandle)?;
        if record.deregistering {
            return Err(SnepError::InvalidHandle);
        }
        record.deregistering = true;
        self.post(Message::Deregister { registration });
        Ok(())
    }

    fn connect(&mut self, client: Handle, service_name: &str) -> Result<Handle> {
        let record = self
            .registry
            .registration(client)
            .ok_or(SnepError::InvalidHandle)?;
        if record.deregistering {
            return Err(SnepError::InvalidHandle);
        }
        if record.role != Role::Client {
            return Err(SnepError::InvalidState("connect requires a client registration"));
        }
        let sap = record
            .sap
            .ok_or(SnepError::InvalidState("registration has not completed"))?;
        if !self.link_active {
            return Err(SnepError::LinkInactive);
        }
        if service_name.is_empty() {
            return Err(SnepError::InvalidArgument(
                "service name must not be empty".to_string(),
            ));
        }
        let in_use = self.registry.connections().into_iter().any(|h| {
            self.registry
                .connection(h)
                .is_some_and(|c| c.registration == client)
        });
        if in_use {
            return Err(SnepError::InvalidState(
                "client registration already has a connection",
            ));
        }

        let handler = record.handler.clone();
        let connection = self.registry.insert(Record::Connection(Connection::new(
            client,
            handler,
            Role::Client,
            Lifecycle::Connecting,
            sap,
            None,
        )))?;
        self.post(Message::Connect {
            connection,
            service_name: service_name.to_string(),
        });
        Ok(connection)
    }

    fn send_get_request(
        &mut self,
        connection: Handle,
        request: Bytes,
        capacity: usize,
        acceptable_length: u32,
    ) -> Result<()> {
        if acceptable_length as usize > capacity {
            return Err(SnepError::InvalidArgument(format!(
                "acceptable length {} exceeds capacity {}",
                acceptable_length, capacity
            )));
        }
        let version = self.config.version;
        let conn = self.idle_client(connection)?;
        conn.exchange = Exchange::Get {
            capacity,
            acceptable_length,
        };
        self.post(Message::Send {
            connection,
            message: OutboundMessage::get_request(request, acceptable_length).with_version(version),
            get_response: false,
        });
        Ok(())
    }

    fn send_put_request(&mut self, connection: Handle, ndef: Bytes) -> Result<()> {
        let version = self.config.version;
        let conn = self.idle_client(connection)?;
        conn.exchange = Exchange::Put;
        self.post(Message::Send {
            connection,
            message: OutboundMessage::new(RequestCode::Put, ndef)
                .with_version(version),
            get_response: false,
        });
        Ok(())
    }

    fn send_get_response(
        &mut self,
        connection: Handle,
        code: ResponseCode,
        ndef: Bytes,
    ) -> Result<()> {
        if !code.is_final() {
            return Err(SnepError::InvalidArgument(format!(
                "{code:?} is not a final response code"
            )));
        }
        if code != ResponseCode::Success && !ndef.is_empty() {
            return Err(SnepError::InvalidArgument(format!(
                "{code:?} response must not carry information"
            )));
        }
        let version = self.config.version;
        let conn = self.connected(connection, Role::Server)?;
        let Exchange::Get {
            acceptable_length, ..
        } = conn.exchange
        else {
            return Err(SnepError::InvalidState("no GET request awaiting a response"));
        };
        if ndef.len() > acceptable_length as usize {
            return Err(SnepError::InvalidArgument(format!(
                "response of {} bytes exceeds acceptable length {}",
                ndef.len(),
                acceptable_length
            )));
        }
        conn.exchange = Exchange::Idle;
        self.post(Message::Send {
            connection,
            message: OutboundMessage::new(code, ndef).with_version(version),
            get_response: true,
        });
        Ok(())
    }

    fn send_put_response(&mut self, connection: Handle, code: ResponseCode) -> Result<()> {
        if !code.is_final() {
            return Err(SnepError::InvalidArgument(format!(
                "{code:?} is not a final response code"
            )));
        }
        let version = self.config.version;
        let conn = self.connected(connection, Role::Server)?;
        if conn.exchange != Exchange::Put {
            return Err(SnepError::InvalidState("no PUT request awaiting a response"));
        }
        conn.exchange = Exchange::Idle;
        self.post(Message::Send {
            connection,
            message: OutboundMessage::bare(code).with_version(version),
            get_response: false,
        });
        Ok(())
    }

    fn disconnect(&mut self, connection: Handle, flush: bool) -> Result<()> {
        let conn = self
            .registry
            .connection_mut(connection)
            .ok_or(SnepError::InvalidHandle)?;
        match conn.lifecycle {
            Lifecycle::Disconnecting => Err(SnepError::InvalidHandle),
            Lifecycle::Connecting => {
                debug!(%connection, "Abandoning connect");
                self.finalize(connection);
                Ok(())
            }
            _ => {
                conn.lifecycle = Lifecycle::Disconnecting;
                conn.response_deadline = None;
                self.post(Message::Disconnect { connection, flush });
                Ok(())
            }
        }
    }
}
