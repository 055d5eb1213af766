//! Handler that forwards events into a tokio channel.
//!
//! Lets async code consume engine events with `recv().await` and answer them
//! through an [`EngineHandle`](crate::driver::EngineHandle).
//!
//! # Example
//!
//! ```
//! use snep_exchange::handler::ChannelHandler;
//!
//! let (handler, mut events) = ChannelHandler::new(64, 1024);
//! assert!(events.try_recv().is_err());
//! # drop(handler);
//! ```

use tokio::sync::mpsc;
use tracing::warn;

use super::{Allocation, ExchangeEvent, ExchangeHandler};
use crate::engine::{ExchangeApi, Handle};
use crate::protocol::RequestCode;

/// Forwards every event into a bounded channel.
///
/// Allocation requests are answered inline: messages up to
/// `max_message_size` bytes get a fresh buffer, larger ones are declined.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<ExchangeEvent>,
    max_message_size: usize,
}

impl ChannelHandler {
    /// Create a handler and the receiver its events arrive on.
    pub fn new(capacity: usize, max_message_size: usize) -> (Self, mpsc::Receiver<ExchangeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                max_message_size,
            },
            rx,
        )
    }

    /// Largest inbound message this handler grants a buffer for.
    #[inline]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl ExchangeHandler for ChannelHandler {
    fn on_event(&self, event: ExchangeEvent, _api: &mut dyn ExchangeApi) {
        if let Err(e) = self.tx.try_send(event) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(event) => ("full", event),
                mpsc::error::TrySendError::Closed(event) => ("closed", event),
            };
            warn!(event = event.name(), reason, "Event channel unavailable, dropping event");
        }
    }

    fn allocate(&self, connection: Handle, request: RequestCode, declared_len: usize) -> Allocation {
        if declared_len > self.max_message_size {
            warn!(
                %connection,
                ?request,
                declared_len,
                max = self.max_message_size,
                "Declining oversized message"
            );
            return Allocation::declined();
        }
        Allocation::granted(declared_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_respects_limit() {
        let (handler, _rx) = ChannelHandler::new(4, 100);
        let conn = Handle::new(0, 0);

        assert!(matches!(
            handler.allocate(conn, RequestCode::Put, 100),
            Allocation::Granted { capacity: 100, .. }
        ));
        assert!(matches!(
            handler.allocate(conn, RequestCode::Put, 101),
            Allocation::Declined { code: None }
        ));
    }

    #[test]
    fn test_max_message_size() {
        let (handler, _rx) = ChannelHandler::new(4, 512);
        assert_eq!(handler.max_message_size(), 512);
    }
}
