//! Dedicated engine task.
//!
//! [`spawn_engine`] moves an [`Engine`] into one tokio task and returns an
//! [`EngineHandle`] that sends it commands over an mpsc channel. Every call
//! is answered through a oneshot, so the synchronous validation of the
//! engine API still reaches the caller.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<Command> ─► Engine task ─► DataLink
//! Caller N ─┘                                 ▲
//!                      link events, timers, poll tick
//! ```
//!
//! The task wakes on a command, on the earliest response deadline, and on a
//! fixed poll tick that picks up events the link queued on its own.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::engine::{Engine, ExchangeApi, Handle};
use crate::error::{Result, SnepError};
use crate::handler::SharedHandler;
use crate::protocol::ResponseCode;
use crate::transport::{DataLink, LinkEvent, Sap};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Work sent to the engine task.
enum Command {
    RegisterServer {
        sap_hint: Option<Sap>,
        service_name: String,
        handler: SharedHandler,
        reply: Reply<Handle>,
    },
    RegisterClient {
        handler: SharedHandler,
        reply: Reply<Handle>,
    },
    Deregister {
        registration: Handle,
        reply: Reply<()>,
    },
    Connect {
        client: Handle,
        service_name: String,
        reply: Reply<Handle>,
    },
    GetRequest {
        connection: Handle,
        request: Bytes,
        capacity: usize,
        acceptable_length: u32,
        reply: Reply<()>,
    },
    PutRequest {
        connection: Handle,
        ndef: Bytes,
        reply: Reply<()>,
    },
    GetResponse {
        connection: Handle,
        code: ResponseCode,
        ndef: Bytes,
        reply: Reply<()>,
    },
    PutResponse {
        connection: Handle,
        code: ResponseCode,
        reply: Reply<()>,
    },
    Disconnect {
        connection: Handle,
        flush: bool,
        reply: Reply<()>,
    },
    Link(LinkEvent),
    Shutdown,
}

/// Handle for talking to an engine task.
///
/// This is cheaply cloneable. Once the task has stopped every call fails
/// with [`SnepError::EngineClosed`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SnepError::EngineClosed)?;
        rx.await.map_err(|_| SnepError::EngineClosed)?
    }

    /// See [`ExchangeApi::register_server`].
    pub async fn register_server(
        &self,
        sap_hint: Option<Sap>,
        service_name: &str,
        handler: SharedHandler,
    ) -> Result<Handle> {
        let service_name = service_name.to_string();
        self.call(|reply| Command::RegisterServer {
            sap_hint,
            service_name,
            handler,
            reply,
        })
        .await
    }

    /// See [`ExchangeApi::register_client`].
    pub async fn register_client(&self, handler: SharedHandler) -> Result<Handle> {
        self.call(|reply| Command::RegisterClient { handler, reply })
            .await
    }

    /// See [`ExchangeApi::deregister`].
    pub async fn deregister(&self, registration: Handle) -> Result<()> {
        self.call(|reply| Command::Deregister {
            registration,
            reply,
        })
        .await
    }

    /// See [`ExchangeApi::connect`].
    pub async fn connect(&self, client: Handle, service_name: &str) -> Result<Handle> {
        let service_name = service_name.to_string();
        self.call(|reply| Command::Connect {
            client,
            service_name,
            reply,
        })
        .await
    }

    /// See [`ExchangeApi::send_get_request`].
    pub async fn send_get_request(
        &self,
        connection: Handle,
        request: Bytes,
        capacity: usize,
        acceptable_length: u32,
    ) -> Result<()> {
        self.call(|reply| Command::GetRequest {
            connection,
            request,
            capacity,
            acceptable_length,
            reply,
        })
        .await
    }

    /// See [`ExchangeApi::send_put_request`].
    pub async fn send_put_request(&self, connection: Handle, ndef: Bytes) -> Result<()> {
        self.call(|reply| Command::PutRequest {
            connection,
            ndef,
            reply,
        })
        .await
    }

    /// See [`ExchangeApi::send_get_response`].
    pub async fn send_get_response(
        &self,
        connection: Handle,
        code: ResponseCode,
        ndef: Bytes,
    ) -> Result<()> {
        self.call(|reply| Command::GetResponse {
            connection,
            code,
            ndef,
            reply,
        })
        .await
    }

    /// See [`ExchangeApi::send_put_response`].
    pub async fn send_put_response(&self, connection: Handle, code: ResponseCode) -> Result<()> {
        self.call(|reply| Command::PutResponse {
            connection,
            code,
            reply,
        })
        .await
    }

    /// See [`ExchangeApi::disconnect`].
    pub async fn disconnect(&self, connection: Handle, flush: bool) -> Result<()> {
        self.call(|reply| Command::Disconnect {
            connection,
            flush,
            reply,
        })
        .await
    }

    /// Feed an event from a data link that reports through a channel
    /// instead of [`DataLink::poll_event`].
    pub async fn link_event(&self, event: LinkEvent) -> Result<()> {
        self.tx
            .send(Command::Link(event))
            .await
            .map_err(|_| SnepError::EngineClosed)
    }

    /// Ask the task to stop. Pending commands ahead of this one still run.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| SnepError::EngineClosed)
    }

    /// True once the engine task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the engine task and return a handle for sending it commands.
///
/// The command channel capacity and poll tick come from the engine's
/// configuration. The task ends when [`EngineHandle::shutdown`] is called
/// or every handle has been dropped.
pub fn spawn_engine<L>(engine: Engine<L>) -> (EngineHandle, JoinHandle<Result<()>>)
where
    L: DataLink + Send + 'static,
{
    let (tx, rx) = mpsc::channel(engine.config().command_capacity);
    let task = tokio::spawn(engine_loop(engine, rx));
    (EngineHandle { tx }, task)
}

async fn engine_loop<L: DataLink>(
    mut engine: Engine<L>,
    mut rx: mpsc::Receiver<Command>,
) -> Result<()> {
    let mut tick = time::interval(engine.config().poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(capacity = engine.capacity(), "Engine task started");

    loop {
        engine.run_pending();
        let deadline = engine.next_deadline();

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => execute(&mut engine, command),
            },
            _ = sleep_until(deadline) => {
                trace!("Response deadline reached");
                engine.handle_timeouts(Instant::now());
            }
            _ = tick.tick() => {}
        }
    }

    debug!(records = engine.record_count(), "Engine task stopped");
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Run one command. A dropped reply receiver is not an error.
fn execute<L: DataLink>(engine: &mut Engine<L>, command: Command) {
    match command {
        Command::RegisterServer {
            sap_hint,
            service_name,
            handler,
            reply,
        } => {
            let _ = reply.send(engine.register_server(sap_hint, &service_name, handler));
        }
        Command::RegisterClient { handler, reply } => {
            let _ = reply.send(engine.register_client(handler));
        }
        Command::Deregister {
            registration,
            reply,
        } => {
            let _ = reply.send(engine.deregister(registration));
        }
        Command::Connect {
            client,
            service_name,
            reply,
        } => {
            let _ = reply.send(engine.connect(client, &service_name));
        }
        Command::GetRequest {
            connection,
            request,
            capacity,
            acceptable_length,
            reply,
        } => {
            let _ = reply.send(engine.send_get_request(
                connection,
                request,
                capacity,
                acceptable_length,
            ));
        }
        Command::PutRequest {
            connection,
            ndef,
            reply,
        } => {
            let _ = reply.send(engine.send_put_request(connection, ndef));
        }
        Command::GetResponse {
            connection,
            code,
            ndef,
            reply,
        } => {
            let _ = reply.send(engine.send_get_response(connection, code, ndef));
        }
        Command::PutResponse {
            connection,
            code,
            reply,
        } => {
            let _ = reply.send(engine.send_put_response(connection, code));
        }
        Command::Disconnect {
            connection,
            flush,
            reply,
        } => {
            let _ = reply.send(engine.disconnect(connection, flush));
        }
        Command::Link(event) => engine.on_link_event(event),
        Command::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::engine::EngineBuilder;
    use crate::handler::{ChannelHandler, ExchangeEvent};
    use crate::transport::memory::MemoryLink;
    use crate::transport::DEFAULT_SERVICE_NAME;

    async fn next(events: &mut mpsc::Receiver<ExchangeEvent>) -> ExchangeEvent {
        time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    struct Side {
        engine: EngineHandle,
        events: mpsc::Receiver<ExchangeEvent>,
        handler: SharedHandler,
    }

    fn side(link: MemoryLink) -> Side {
        let engine = EngineBuilder::new().build(link).unwrap();
        let (engine, _task) = spawn_engine(engine);
        let (handler, events) = ChannelHandler::new(32, 4096);
        Side {
            engine,
            events,
            handler: Arc::new(handler),
        }
    }

    /// Server and client engines in separate tasks, connected.
    async fn connected() -> (Side, Handle, Side, Handle) {
        let (a, b) = MemoryLink::pair();
        let wire = a.clone();
        let mut server = side(a);
        let mut client = side(b);

        server
            .engine
            .register_server(Some(0x04), DEFAULT_SERVICE_NAME, server.handler.clone())
            .await
            .unwrap();
        assert!(matches!(next(&mut server.events).await, ExchangeEvent::Registered { .. }));

        let registration = client
            .engine
            .register_client(client.handler.clone())
            .await
            .unwrap();
        assert!(matches!(next(&mut client.events).await, ExchangeEvent::Registered { .. }));

        wire.set_link_active(true);
        assert!(matches!(
            next(&mut client.events).await,
            ExchangeEvent::LinkActivated { .. }
        ));

        let connection = client
            .engine
            .connect(registration, DEFAULT_SERVICE_NAME)
            .await
            .unwrap();
        let server_conn = match next(&mut server.events).await {
            ExchangeEvent::Connected { connection, .. } => connection,
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(
            next(&mut client.events).await,
            ExchangeEvent::Connected { connection: c, .. } if c == connection
        ));
        (server, server_conn, client, connection)
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_between_tasks() {
        let (mut server, server_conn, mut client, connection) = connected().await;
        let ndef = Bytes::from(vec![0x33u8; 700]);

        client
            .engine
            .send_put_request(connection, ndef.clone())
            .await
            .unwrap();
        match next(&mut server.events).await {
            ExchangeEvent::PutRequest { ndef: got, .. } => assert_eq!(&got[..], &ndef[..]),
            other => panic!("unexpected {other:?}"),
        }

        server
            .engine
            .send_put_response(server_conn, ResponseCode::Success)
            .await
            .unwrap();
        assert!(matches!(
            next(&mut client.events).await,
            ExchangeEvent::PutResponse {
                code: ResponseCode::Success,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_in_task() {
        let (mut server, _server_conn, mut client, connection) = connected().await;

        client
            .engine
            .send_put_request(connection, Bytes::from_static(b"unanswered"))
            .await
            .unwrap();
        assert!(matches!(
            next(&mut server.events).await,
            ExchangeEvent::PutRequest { .. }
        ));

        let started = Instant::now();
        match next(&mut client.events).await {
            ExchangeEvent::Disconnected { reclaimed, .. } => {
                assert_eq!(reclaimed.outbound.as_deref(), Some(&b"unanswered"[..]));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_validation_errors_reach_caller() {
        let (a, _b) = MemoryLink::pair();
        let s = side(a);
        let client = s.engine.register_client(s.handler.clone()).await.unwrap();

        assert!(matches!(
            s.engine.connect(client, DEFAULT_SERVICE_NAME).await,
            Err(SnepError::InvalidState(_)) | Err(SnepError::LinkInactive)
        ));
        assert!(matches!(
            s.engine.disconnect(client, false).await,
            Err(SnepError::InvalidHandle)
        ));
    }

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let (a, _b) = MemoryLink::pair();
        let engine = EngineBuilder::new().build(a).unwrap();
        let (handle, task) = spawn_engine(engine);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        assert!(handle.is_closed());
        let (handler, _events) = ChannelHandler::new(1, 16);
        assert!(matches!(
            handle.register_client(Arc::new(handler)).await,
            Err(SnepError::EngineClosed)
        ));
    }

    #[tokio::test]
    async fn test_link_event_through_handle() {
        let (a, _b) = MemoryLink::pair();
        let mut s = side(a);
        s.engine.register_client(s.handler.clone()).await.unwrap();
        assert!(matches!(next(&mut s.events).await, ExchangeEvent::Registered { .. }));

        s.engine
            .link_event(LinkEvent::LinkStatus { activated: true })
            .await
            .unwrap();
        assert!(matches!(
            next(&mut s.events).await,
            ExchangeEvent::LinkActivated { .. }
        ));
    }
}
