//! Default-server gateway.
//!
//! [`DefaultServer`] is a ready-made [`ExchangeHandler`] for the well-known
//! server (SAP `0x04`, `urn:nfc:sn:snep`). Completed PUT messages are handed
//! to an [`NdefDispatcher`] and answered SUCCESS; GET is not offered and is
//! answered NOT_IMPLEMENTED. The gateway keeps its own connection table,
//! bounded independently of the engine's record arena, and receives into a
//! small [`BufferPool`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use snep_exchange::engine::{EngineBuilder, Handle};
//! use snep_exchange::gateway::{DefaultServer, GatewayConfig};
//! use snep_exchange::transport::memory::MemoryLink;
//!
//! let (link, _peer) = MemoryLink::pair();
//! let mut engine = EngineBuilder::new().build(link).unwrap();
//!
//! let server = Arc::new(DefaultServer::new(GatewayConfig::default(), |_conn: Handle, ndef: &[u8]| {
//!     println!("received {} bytes", ndef.len());
//! }));
//! server.register(&mut engine).unwrap();
//! engine.run_pending();
//! assert!(server.registration().is_some());
//! ```

mod pool;

pub use pool::BufferPool;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::driver::EngineHandle;
use crate::engine::{ExchangeApi, Handle};
use crate::error::{Result, SnepError};
use crate::handler::{Allocation, ExchangeEvent, ExchangeHandler};
use crate::protocol::{RequestCode, ResponseCode};
use crate::transport::{DEFAULT_SERVER_SAP, DEFAULT_SERVICE_NAME};

/// Default number of concurrent gateway connections.
pub const DEFAULT_GATEWAY_CONNECTIONS: usize = 3;

/// Default largest message the gateway accepts.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;

/// Default number of receive buffers.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Consumer of messages delivered to the default server.
pub trait NdefDispatcher: Send + Sync + 'static {
    /// Take one complete message. The bytes are only valid for the call.
    fn dispatch(&self, connection: Handle, ndef: &[u8]);
}

impl<F> NdefDispatcher for F
where
    F: Fn(Handle, &[u8]) + Send + Sync + 'static,
{
    fn dispatch(&self, connection: Handle, ndef: &[u8]) {
        self(connection, ndef)
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Connections served at once. Further peers are disconnected.
    pub max_connections: usize,
    /// Largest message accepted. Larger ones are declined.
    pub max_message_size: usize,
    /// Receive buffers shared by all connections.
    pub pool_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_GATEWAY_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reject zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 || self.max_message_size == 0 || self.pool_size == 0 {
            return Err(SnepError::Config(
                "gateway limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Table {
    registration: Option<Handle>,
    connections: Vec<Handle>,
    delivered: u64,
}

/// Handler for the well-known default server.
pub struct DefaultServer<D: NdefDispatcher> {
    config: GatewayConfig,
    dispatcher: D,
    pool: BufferPool,
    table: Mutex<Table>,
}

impl<D: NdefDispatcher> DefaultServer<D> {
    /// Create a gateway that hands each received message to `dispatcher`.
    /// The receive pool holds `pool_size` buffers of `max_message_size`.
    pub fn new(config: GatewayConfig, dispatcher: D) -> Self {
        Self {
            pool: BufferPool::new(config.pool_size, config.max_message_size),
            config,
            dispatcher,
            table: Mutex::new(Table::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register under the well-known SAP and service name.
    pub fn register(self: &Arc<Self>, api: &mut dyn ExchangeApi) -> Result<Handle> {
        api.register_server(Some(DEFAULT_SERVER_SAP), DEFAULT_SERVICE_NAME, self.clone())
    }

    /// Register through a running engine task.
    pub async fn register_on(self: &Arc<Self>, engine: &EngineHandle) -> Result<Handle> {
        engine
            .register_server(Some(DEFAULT_SERVER_SAP), DEFAULT_SERVICE_NAME, self.clone())
            .await
    }

    /// Limits the gateway runs with.
    #[inline]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Receive buffer pool.
    #[inline]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Registration handle once the data link accepted it.
    pub fn registration(&self) -> Option<Handle> {
        self.table().registration
    }

    /// Connections currently in the table.
    pub fn active_connections(&self) -> usize {
        self.table().connections.len()
    }

    /// Messages dispatched so far.
    pub fn delivered(&self) -> u64 {
        self.table().delivered
    }

    fn on_connected(&self, connection: Handle, api: &mut dyn ExchangeApi) {
        let mut table = self.table();
        if table.connections.len() >= self.config.max_connections {
            drop(table);
            warn!(
                %connection,
                max = self.config.max_connections,
                "Gateway connection limit reached, disconnecting"
            );
            if let Err(e) = api.disconnect(connection, false) {
                warn!(%connection, error = %e, "Disconnect failed");
            }
            return;
        }
        table.connections.push(connection);
        debug!(%connection, active = table.connections.len(), "Gateway connection opened");
    }

    fn on_put(&self, connection: Handle, ndef: BytesMut, api: &mut dyn ExchangeApi) {
        self.dispatcher.dispatch(connection, &ndef);
        self.table().delivered += 1;
        debug!(%connection, len = ndef.len(), "Message dispatched");
        self.pool.release(ndef);

        if let Err(e) = api.send_put_response(connection, ResponseCode::Success) {
            warn!(%connection, error = %e, "Could not answer PUT");
        }
    }

    fn on_get(&self, connection: Handle, ndef: BytesMut, api: &mut dyn ExchangeApi) {
        self.pool.release(ndef);
        debug!(%connection, "GET not offered by the default server");
        if let Err(e) =
            api.send_get_response(connection, ResponseCode::NotImplemented, Bytes::new())
        {
            warn!(%connection, error = %e, "Could not answer GET");
        }
    }
}

impl<D: NdefDispatcher> ExchangeHandler for DefaultServer<D> {
    fn on_event(&self, event: ExchangeEvent, api: &mut dyn ExchangeApi) {
        match event {
            ExchangeEvent::Registered { registration, .. } => {
                info!(%registration, sap = DEFAULT_SERVER_SAP, "Default server listening");
                self.table().registration = Some(registration);
            }
            ExchangeEvent::RegistrationFailed {
                registration,
                reason,
            } => {
                warn!(%registration, reason, "Default server registration failed");
            }
            ExchangeEvent::Connected { connection, .. } => self.on_connected(connection, api),
            ExchangeEvent::PutRequest { connection, ndef } => self.on_put(connection, ndef, api),
            ExchangeEvent::GetRequest {
                connection, ndef, ..
            } => self.on_get(connection, ndef, api),
            ExchangeEvent::Disconnected {
                connection,
                reclaimed,
            } => {
                self.table().connections.retain(|c| *c != connection);
                if let Some(inbound) = reclaimed.inbound {
                    self.pool.release(inbound);
                }
                debug!(%connection, "Gateway connection closed");
            }
            other => trace!(event = other.name(), "Ignored by default server"),
        }
    }

    fn allocate(&self, connection: Handle, request: RequestCode, declared_len: usize) -> Allocation {
        if declared_len > self.config.max_message_size {
            warn!(
                %connection,
                ?request,
                declared_len,
                max = self.config.max_message_size,
                "Message too large for the default server"
            );
            return Allocation::declined();
        }
        match self.pool.acquire() {
            Some(buffer) => Allocation::Granted {
                buffer,
                capacity: self.config.max_message_size,
            },
            None => {
                warn!(%connection, "Receive pool exhausted");
                Allocation::declined()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineBuilder};
    use crate::handler::ChannelHandler;
    use crate::transport::memory::MemoryLink;
    use tokio::sync::mpsc;

    type Received = Arc<Mutex<Vec<Vec<u8>>>>;

    fn recording() -> (Received, impl NdefDispatcher) {
        let received: Received = Arc::default();
        let sink = received.clone();
        (received, move |_: Handle, ndef: &[u8]| {
            sink.lock().unwrap().push(ndef.to_vec())
        })
    }

    fn pump(a: &mut Engine<MemoryLink>, b: &mut Engine<MemoryLink>) {
        for _ in 0..32 {
            a.run_pending();
            b.run_pending();
        }
    }

    struct Fixture<D: NdefDispatcher> {
        server: Engine<MemoryLink>,
        client: Engine<MemoryLink>,
        gateway: Arc<DefaultServer<D>>,
        events: mpsc::Receiver<ExchangeEvent>,
        handler: Arc<ChannelHandler>,
    }

    fn fixture<D: NdefDispatcher>(config: GatewayConfig, dispatcher: D) -> Fixture<D> {
        let (a, b) = MemoryLink::pair();
        a.set_link_active(true);
        let mut server = EngineBuilder::new().build(a).unwrap();
        let mut client = EngineBuilder::new().build(b).unwrap();

        let gateway = Arc::new(DefaultServer::new(config, dispatcher));
        gateway.register(&mut server).unwrap();
        let (handler, events) = ChannelHandler::new(64, 4096);
        pump(&mut server, &mut client);

        Fixture {
            server,
            client,
            gateway,
            events,
            handler: Arc::new(handler),
        }
    }

    impl<D: NdefDispatcher> Fixture<D> {
        fn connect(&mut self) -> Handle {
            let registration = self.client.register_client(self.handler.clone()).unwrap();
            pump(&mut self.server, &mut self.client);
            let connection = self
                .client
                .connect(registration, DEFAULT_SERVICE_NAME)
                .unwrap();
            pump(&mut self.server, &mut self.client);
            connection
        }

        fn drain(&mut self) -> Vec<ExchangeEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }
    }

    #[test]
    fn test_put_dispatched_and_acknowledged() {
        let (received, dispatcher) = recording();
        let mut fx = fixture(GatewayConfig::default(), dispatcher);
        assert!(fx.gateway.registration().is_some());
        let connection = fx.connect();
        assert_eq!(fx.gateway.active_connections(), 1);
        fx.drain();

        let ndef: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        fx.client
            .send_put_request(connection, Bytes::from(ndef.clone()))
            .unwrap();
        pump(&mut fx.server, &mut fx.client);

        assert_eq!(*received.lock().unwrap(), vec![ndef]);
        assert_eq!(fx.gateway.delivered(), 1);
        assert_eq!(fx.gateway.pool().outstanding(), 0);
        assert!(fx.drain().iter().any(|e| matches!(
            e,
            ExchangeEvent::PutResponse {
                code: ResponseCode::Success,
                ..
            }
        )));
    }

    #[test]
    fn test_get_not_implemented() {
        let (received, dispatcher) = recording();
        let mut fx = fixture(GatewayConfig::default(), dispatcher);
        let connection = fx.connect();
        fx.drain();

        fx.client
            .send_get_request(connection, Bytes::from_static(b"query"), 256, 256)
            .unwrap();
        pump(&mut fx.server, &mut fx.client);

        assert!(received.lock().unwrap().is_empty());
        assert_eq!(fx.gateway.pool().outstanding(), 0);
        assert!(fx.drain().iter().any(|e| matches!(
            e,
            ExchangeEvent::GetResponse {
                code: ResponseCode::NotImplemented,
                ..
            }
        )));
    }

    #[test]
    fn test_connection_limit_disconnects_extra_peers() {
        let config = GatewayConfig {
            max_connections: 1,
            ..Default::default()
        };
        let (_received, dispatcher) = recording();
        let mut fx = fixture(config, dispatcher);

        let first = fx.connect();
        let second = fx.connect();

        assert_eq!(fx.gateway.active_connections(), 1);
        assert!(fx.client.lifecycle(first).is_some());
        assert!(fx.client.lifecycle(second).is_none());
        assert!(fx.drain().iter().any(|e| matches!(
            e,
            ExchangeEvent::Disconnected { connection, .. } if *connection == second
        )));
    }

    #[test]
    fn test_oversized_put_declined() {
        let config = GatewayConfig {
            max_message_size: 64,
            ..Default::default()
        };
        let (received, dispatcher) = recording();
        let mut fx = fixture(config, dispatcher);
        let connection = fx.connect();
        fx.drain();

        fx.client
            .send_put_request(connection, Bytes::from(vec![0u8; 300]))
            .unwrap();
        pump(&mut fx.server, &mut fx.client);

        assert!(received.lock().unwrap().is_empty());
        assert!(fx.drain().iter().any(|e| matches!(
            e,
            ExchangeEvent::PutResponse {
                code: ResponseCode::Reject,
                ..
            }
        )));
        assert_eq!(fx.client.lifecycle(connection), Some(crate::engine::Lifecycle::Connected));
    }

    #[test]
    fn test_partial_message_returned_to_pool_on_disconnect() {
        let (_received, dispatcher) = recording();
        let mut fx = fixture(GatewayConfig::default(), dispatcher);
        let connection = fx.connect();

        fx.client
            .send_put_request(connection, Bytes::from(vec![1u8; 600]))
            .unwrap();
        fx.client.run_pending();
        fx.server.run_pending();
        assert_eq!(fx.gateway.pool().outstanding(), 1);

        fx.client.disconnect(connection, false).unwrap();
        pump(&mut fx.server, &mut fx.client);
        assert_eq!(fx.gateway.pool().outstanding(), 0);
        assert_eq!(fx.gateway.active_connections(), 0);
    }

    #[test]
    fn test_config_json() {
        let config = GatewayConfig::from_json(r#"{"pool_size": 8}"#).unwrap();
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.max_connections, DEFAULT_GATEWAY_CONNECTIONS);

        assert!(matches!(
            GatewayConfig::from_json(r#"{"max_message_size": 0}"#),
            Err(SnepError::Config(_))
        ));
        assert!(matches!(
            GatewayConfig::from_json(r#"{"pool": 1}"#),
            Err(SnepError::Json(_))
        ));

        let json = config.to_json().unwrap();
        assert_eq!(GatewayConfig::from_json(&json).unwrap(), config);
    }
}
