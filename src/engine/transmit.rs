//! Transmit engine.
//!
//! Slices the connection's outbound message into fragments of at most the
//! negotiated MIU. The first fragment goes out immediately; the rest wait
//! for the peer's CONTINUE and are then drained by `send_remaining`, which
//! stops whenever the link reports congestion.

use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::registry::{Handle, Side};
use super::Engine;
use crate::handler::ExchangeEvent;
use crate::protocol::{Opcode, OutboundMessage, Role, HEADER_SIZE};
use crate::transport::{DataLink, SendStatus};

/// Outcome of handing one fragment to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Accepted, more to send.
    Sent,
    /// Accepted, more to send, link congested.
    Stalled,
    /// The last fragment was accepted.
    Complete,
    /// Refused by the link.
    Failed,
}

impl<L: DataLink> Engine<L> {
    /// Start transmitting `message`.
    pub(super) fn transmit(&mut self, handle: Handle, message: OutboundMessage, get_response: bool) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        trace!(
            connection = %handle,
            opcode = message.opcode(),
            len = message.total_len(),
            miu = conn.miu,
            "Transmit"
        );
        conn.outbound = Some(message);
        conn.get_response = get_response;

        match self.send_fragment(handle) {
            Step::Complete => self.on_transmit_complete(handle),
            Step::Failed => self.on_send_failure(handle),
            Step::Sent | Step::Stalled => {
                let Some(conn) = self.registry.connection_mut(handle) else {
                    return;
                };
                let side = match conn.role {
                    Role::Client => Side::Request,
                    Role::Server => Side::Response,
                };
                conn.awaiting_continue = Some(side);
                if conn.role == Role::Client {
                    self.arm_response_timer(handle);
                }
            }
        }
    }

    /// Drain the rest of the outbound message after the peer's CONTINUE.
    pub(super) fn send_remaining(&mut self, handle: Handle) {
        loop {
            let Some(conn) = self.registry.connection(handle) else {
                return;
            };
            if conn.outbound.is_none() {
                return;
            }
            if conn.congested {
                debug!(connection = %handle, "Transmission paused by congestion");
                return;
            }

            match self.send_fragment(handle) {
                Step::Sent => continue,
                Step::Stalled => return,
                Step::Complete => return self.on_transmit_complete(handle),
                Step::Failed => return self.on_send_failure(handle),
            }
        }
    }

    /// Send a header-only message outside the outbound slot.
    pub(super) fn send_control(&mut self, handle: Handle, opcode: impl Into<Opcode>) {
        let opcode = opcode.into();
        let pdu = OutboundMessage::bare(opcode)
            .with_version(self.config.version)
            .peek_fragment(HEADER_SIZE);

        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        let Some(addr) = conn.addr() else {
            return;
        };
        trace!(connection = %handle, %addr, %opcode, "Sending control message");

        match self.link.send(addr, pdu) {
            SendStatus::Ok => {}
            SendStatus::Congested => conn.congested = true,
            SendStatus::Fail => self.on_send_failure(handle),
        }
    }

    pub(super) fn arm_response_timer(&mut self, handle: Handle) {
        let timeout = self.config.response_timeout;
        if let Some(conn) = self.registry.connection_mut(handle) {
            trace!(connection = %handle, ?timeout, "Response timer armed");
            conn.response_deadline = Some(Instant::now() + timeout);
        }
    }

    fn send_fragment(&mut self, handle: Handle) -> Step {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return Step::Failed;
        };
        let Some(addr) = conn.addr() else {
            return Step::Failed;
        };
        let miu = conn.miu.max(1);
        let Some(message) = conn.outbound.as_mut() else {
            return Step::Complete;
        };

        let fragment = message.peek_fragment(miu);
        let len = fragment.len();
        match self.link.send(addr, fragment) {
            SendStatus::Ok => message.advance(len),
            SendStatus::Congested => {
                message.advance(len);
                conn.congested = true;
            }
            SendStatus::Fail => return Step::Failed,
        }
        trace!(
            connection = %handle,
            len,
            sent = message.sent(),
            total = message.total_len(),
            "Fragment sent"
        );

        if message.is_complete() {
            Step::Complete
        } else if conn.congested {
            Step::Stalled
        } else {
            Step::Sent
        }
    }

    fn on_transmit_complete(&mut self, handle: Handle) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        conn.awaiting_continue = None;
        let Some(message) = conn.outbound.take() else {
            return;
        };
        debug!(connection = %handle, len = message.total_len(), "Transfer complete");

        match conn.role {
            Role::Client => {
                conn.retained = Some(message.into_ndef());
                self.arm_response_timer(handle);
            }
            Role::Server if conn.get_response => {
                conn.get_response = false;
                let previous = conn.retained.replace(message.into_ndef());
                let handler = conn.handler.clone();
                if let Some(addr) = conn.addr() {
                    self.link.set_send_complete_notify(addr);
                }
                if let Some(buffer) = previous {
                    self.emit(
                        handler,
                        ExchangeEvent::GetResponseSendComplete {
                            connection: handle,
                            buffer,
                        },
                    );
                }
            }
            Role::Server => {}
        }
    }

    fn on_send_failure(&mut self, handle: Handle) {
        error!(connection = %handle, "Transport refused PDU, disconnecting");
        self.close(handle);
    }
}
