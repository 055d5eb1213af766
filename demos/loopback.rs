//! Loopback - two engines exchanging messages over an in-memory link.
//!
//! This example demonstrates:
//! - Running each engine in its own task with `spawn_engine`
//! - Serving the well-known default server through the gateway
//! - Sending a PUT larger than the fragment size from a client
//! - Reading a GET answer from a custom server
//!
//! # Running
//!
//! ```text
//! RUST_LOG=snep_exchange=debug cargo run --example loopback
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use snep_exchange::engine::{EngineBuilder, ExchangeApi, Handle};
use snep_exchange::gateway::{DefaultServer, GatewayConfig};
use snep_exchange::handler::{ChannelHandler, ExchangeEvent, ExchangeHandler};
use snep_exchange::spawn_engine;
use snep_exchange::transport::memory::MemoryLink;
use snep_exchange::transport::DEFAULT_SERVICE_NAME;
use snep_exchange::ResponseCode;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Service name of the GET server.
const GREETER_SERVICE: &str = "urn:nfc:sn:demo-greeter";

/// Answers every GET with a fixed greeting.
struct Greeter;

impl ExchangeHandler for Greeter {
    fn on_event(&self, event: ExchangeEvent, api: &mut dyn ExchangeApi) {
        if let ExchangeEvent::GetRequest {
            connection,
            acceptable_length,
            ..
        } = event
        {
            let mut reply = b"hello from the loopback server".to_vec();
            reply.truncate(acceptable_length as usize);
            if let Err(e) = api.send_get_response(connection, ResponseCode::Success, reply.into()) {
                tracing::warn!(error = %e, "Could not answer GET");
            }
        }
    }
}

async fn wait_for(
    events: &mut mpsc::Receiver<ExchangeEvent>,
    mut pred: impl FnMut(&ExchangeEvent) -> bool,
) -> Result<ExchangeEvent, Box<dyn std::error::Error>> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await?
            .ok_or("event channel closed")?;
        tracing::info!(event = event.name(), "Client event");
        if pred(&event) {
            return Ok(event);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (server_link, client_link) = MemoryLink::pair();
    let wire = server_link.clone();
    let (server, server_task) = spawn_engine(EngineBuilder::new().build(server_link)?);
    let (client, client_task) = spawn_engine(EngineBuilder::new().build(client_link)?);

    // Server side: default server plus a GET service.
    let gateway = Arc::new(DefaultServer::new(
        GatewayConfig::default(),
        |connection: Handle, ndef: &[u8]| {
            tracing::info!(%connection, len = ndef.len(), "Default server received a message");
        },
    ));
    gateway.register_on(&server).await?;
    server
        .register_server(None, GREETER_SERVICE, Arc::new(Greeter))
        .await?;

    // Client side.
    let (handler, mut events) = ChannelHandler::new(64, 1024);
    let registration = client.register_client(Arc::new(handler)).await?;
    wire.set_link_active(true);
    wait_for(&mut events, |e| matches!(e, ExchangeEvent::LinkActivated { .. })).await?;

    let connection = client.connect(registration, DEFAULT_SERVICE_NAME).await?;
    wait_for(&mut events, |e| matches!(e, ExchangeEvent::Connected { .. })).await?;

    let ndef: Bytes = (0..600u32).map(|i| i as u8).collect::<Vec<u8>>().into();
    client.send_put_request(connection, ndef).await?;
    if let ExchangeEvent::PutResponse { code, .. } =
        wait_for(&mut events, |e| matches!(e, ExchangeEvent::PutResponse { .. })).await?
    {
        println!("PUT answered with {code:?}");
    }

    client.disconnect(connection, true).await?;
    wait_for(&mut events, |e| matches!(e, ExchangeEvent::Disconnected { .. })).await?;

    let connection = client.connect(registration, GREETER_SERVICE).await?;
    wait_for(&mut events, |e| matches!(e, ExchangeEvent::Connected { .. })).await?;
    client
        .send_get_request(connection, Bytes::from_static(b"greeting?"), 256, 256)
        .await?;
    if let ExchangeEvent::GetResponse { code, ndef, .. } =
        wait_for(&mut events, |e| matches!(e, ExchangeEvent::GetResponse { .. })).await?
    {
        println!("GET answered with {code:?}: {}", String::from_utf8_lossy(&ndef));
    }

    client.shutdown().await?;
    server.shutdown().await?;
    client_task.await??;
    server_task.await??;
    Ok(())
}
