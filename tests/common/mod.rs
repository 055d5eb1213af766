//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use snep_exchange::engine::{Engine, EngineBuilder, ExchangeApi, Handle};
use snep_exchange::handler::{Allocation, ExchangeEvent, ExchangeHandler};
use snep_exchange::protocol::{RequestCode, ResponseCode};
use snep_exchange::transport::memory::{MemoryLink, MemoryLinkConfig};
use snep_exchange::transport::DEFAULT_SERVICE_NAME;

/// Install a test subscriber once. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How a [`Recorder`] reacts to requests.
#[derive(Debug, Clone)]
pub enum Policy {
    /// Grant buffers, answer nothing.
    Passive,
    /// Decline every allocation.
    Decline,
    /// Grant buffers, answer PUT with SUCCESS and GET with `reply`.
    Answer { reply: Bytes },
    /// Grant buffers, answer PUT with SUCCESS and GET with the request's
    /// own message.
    Echo,
}

/// Handler that records every event and optionally answers requests.
pub struct Recorder {
    events: Mutex<Vec<ExchangeEvent>>,
    policy: Policy,
}

impl Recorder {
    pub fn new(policy: Policy) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            policy,
        })
    }

    pub fn take(&self) -> Vec<ExchangeEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Handle of the most recent `Connected` event, consuming all events.
    pub fn connected(&self) -> Option<Handle> {
        self.take().into_iter().rev().find_map(|e| match e {
            ExchangeEvent::Connected { connection, .. } => Some(connection),
            _ => None,
        })
    }
}

impl ExchangeHandler for Recorder {
    fn on_event(&self, event: ExchangeEvent, api: &mut dyn ExchangeApi) {
        let answers = matches!(self.policy, Policy::Answer { .. } | Policy::Echo);
        match &event {
            ExchangeEvent::GetRequest {
                connection, ndef, ..
            } if answers => {
                let reply = match &self.policy {
                    Policy::Answer { reply } => reply.clone(),
                    _ => Bytes::copy_from_slice(ndef),
                };
                api.send_get_response(*connection, ResponseCode::Success, reply)
                    .unwrap();
            }
            ExchangeEvent::PutRequest { connection, .. } if answers => {
                api.send_put_response(*connection, ResponseCode::Success)
                    .unwrap();
            }
            _ => {}
        }
        self.events.lock().unwrap().push(event);
    }

    fn allocate(&self, _: Handle, _: RequestCode, declared_len: usize) -> Allocation {
        match self.policy {
            Policy::Decline => Allocation::declined(),
            _ => Allocation::granted(declared_len),
        }
    }
}

/// Two engines on one in-memory link, stepped by hand.
pub struct Pair {
    pub server: Engine<MemoryLink>,
    pub client: Engine<MemoryLink>,
    /// Clone of the server engine's link end.
    pub server_wire: MemoryLink,
    /// Clone of the client engine's link end.
    pub client_wire: MemoryLink,
}

impl Pair {
    /// Active link, default configuration on both sides.
    pub fn new() -> Self {
        Self::with(EngineBuilder::new(), EngineBuilder::new())
    }

    pub fn with(server: EngineBuilder, client: EngineBuilder) -> Self {
        Self::build(server, client, MemoryLink::pair())
    }

    /// Default engines over ends advertising `server_link` and `client_link`.
    pub fn with_links(server_link: MemoryLinkConfig, client_link: MemoryLinkConfig) -> Self {
        Self::build(
            EngineBuilder::new(),
            EngineBuilder::new(),
            MemoryLink::pair_with(server_link, client_link),
        )
    }

    fn build(server: EngineBuilder, client: EngineBuilder, (a, b): (MemoryLink, MemoryLink)) -> Self {
        init_tracing();
        a.set_link_active(true);
        Self {
            server_wire: a.clone(),
            client_wire: b.clone(),
            server: server.build(a).unwrap(),
            client: client.build(b).unwrap(),
        }
    }

    /// Step both engines until the traffic settles.
    pub fn pump(&mut self) {
        for _ in 0..64 {
            self.client.run_pending();
            self.server.run_pending();
        }
    }

    /// Register a client with `handler` and connect it to the default
    /// service. Returns the client-side connection handle.
    pub fn connect(&mut self, handler: Arc<Recorder>) -> Handle {
        let registration = self.client.register_client(handler).unwrap();
        self.pump();
        let connection = self
            .client
            .connect(registration, DEFAULT_SERVICE_NAME)
            .unwrap();
        self.pump();
        connection
    }
}
