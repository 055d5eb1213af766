//! Receive engine.
//!
//! The first fragment of a message is validated against the connection's
//! role, sized, and given a buffer. Later fragments append to that buffer
//! until the declared length is reached. Nothing is ever written past the
//! declared length; a peer that sends more is disconnected.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::registry::{Exchange, Handle, Inbound, Lifecycle, Side};
use super::Engine;
use crate::handler::{Allocation, ExchangeEvent};
use crate::protocol::{
    decode_accept_length, Header, Opcode, Reassembly, RequestCode, ResponseCode, Role, Violation,
    ACCEPT_LENGTH_SIZE, HEADER_SIZE,
};
use crate::transport::{DataLink, LinkAddr};

impl<L: DataLink> Engine<L> {
    /// Entry point for a data indication on a live connection.
    pub(super) fn on_data(&mut self, handle: Handle) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        let Some(addr) = conn.addr() else {
            return;
        };
        conn.response_deadline = None;

        if conn.lifecycle != Lifecycle::Connected {
            let dropped = self.link.flush_unread(addr);
            trace!(connection = %handle, dropped, "Data while disconnecting");
            return;
        }

        if conn.inbound.is_some() {
            self.receive_continuation(handle, addr);
        } else {
            self.receive_first(handle, addr);
        }
    }

    /// Read up to `len` bytes, crossing PDU boundaries if needed.
    fn read_exact(&mut self, addr: LinkAddr, len: usize) -> Bytes {
        let first = self.link.read(addr, len);
        if first.data.len() >= len || !first.more {
            return first.data;
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.extend_from_slice(&first.data);
        while buf.len() < len {
            let next = self.link.read(addr, len - buf.len());
            if next.data.is_empty() {
                break;
            }
            buf.extend_from_slice(&next.data);
            if !next.more {
                break;
            }
        }
        buf.freeze()
    }

    /// Copy whatever is queued into `reassembly`, never past its declared
    /// length. Returns the link's "more data" flag after the last read.
    fn fill(&mut self, addr: LinkAddr, reassembly: &mut Reassembly) -> bool {
        let mut more = false;
        while !reassembly.is_complete() {
            let read = self.link.read(addr, reassembly.remaining());
            more = read.more;
            if read.data.is_empty() {
                break;
            }
            if reassembly.push(&read.data).is_err() {
                return true;
            }
            if !more {
                break;
            }
        }
        more
    }

    fn receive_first(&mut self, handle: Handle, addr: LinkAddr) {
        let data = self.read_exact(addr, HEADER_SIZE);
        if data.is_empty() {
            return;
        }
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        let role = conn.role;

        let Some(header) = Header::decode(&data) else {
            warn!(connection = %handle, len = data.len(), "Fragment shorter than header");
            self.link.flush_unread(addr);
            return self.malformed(handle, role);
        };
        conn.rx_code = Some(header.opcode);
        trace!(
            connection = %handle,
            version = header.version,
            opcode = header.opcode,
            len = header.information_length,
            "Message header"
        );

        match header.validate_for(role, self.config.version) {
            Err(violation) => self.on_violation(handle, addr, role, violation),
            Ok(Opcode::Request(code)) => self.on_request(handle, addr, header, code),
            Ok(Opcode::Response(code)) => self.on_response(handle, addr, header, code),
        }
    }

    fn malformed(&mut self, handle: Handle, role: Role) {
        match role {
            Role::Server => self.send_control(handle, ResponseCode::BadRequest),
            Role::Client => self.close(handle),
        }
    }

    fn on_violation(&mut self, handle: Handle, addr: LinkAddr, role: Role, violation: Violation) {
        self.link.flush_unread(addr);
        match violation {
            Violation::UnsupportedVersion(_) => {
                warn!(connection = %handle, %violation, "Message dropped");
                match role {
                    Role::Server => self.send_control(handle, ResponseCode::UnsupportedVersion),
                    Role::Client => self.finish_request(
                        handle,
                        ResponseCode::UnsupportedVersion,
                        BytesMut::new(),
                    ),
                }
            }
            Violation::WrongDirection(_) => {
                warn!(connection = %handle, %violation, "Disconnecting");
                self.close(handle);
            }
            Violation::NotImplemented(_) => {
                warn!(connection = %handle, %violation, "Message dropped");
                match role {
                    Role::Server => self.send_control(handle, ResponseCode::NotImplemented),
                    Role::Client => self.close(handle),
                }
            }
        }
    }

    /// Server side: a request-class opcode from the peer.
    fn on_request(&mut self, handle: Handle, addr: LinkAddr, header: Header, code: RequestCode) {
        match code {
            RequestCode::Continue => {
                self.link.flush_unread(addr);
                if self.take_awaiting(handle, Side::Response) {
                    debug!(connection = %handle, "Peer ready, sending remaining fragments");
                    self.send_remaining(handle);
                } else {
                    warn!(connection = %handle, "Ignoring CONTINUE with nothing to continue");
                }
            }
            RequestCode::Reject => {
                self.link.flush_unread(addr);
                if !self.take_awaiting(handle, Side::Response) {
                    warn!(connection = %handle, "Ignoring REJECT with nothing to abort");
                    return;
                }
                let Some(conn) = self.registry.connection_mut(handle) else {
                    return;
                };
                conn.get_response = false;
                let Some(message) = conn.outbound.take() else {
                    return;
                };
                let handler = conn.handler.clone();
                debug!(connection = %handle, "Peer rejected remaining fragments");
                self.emit(
                    handler,
                    ExchangeEvent::GetResponseSendComplete {
                        connection: handle,
                        buffer: message.into_ndef(),
                    },
                );
            }
            RequestCode::Get | RequestCode::Put => self.on_new_request(handle, addr, header, code),
        }
    }

    fn on_new_request(&mut self, handle: Handle, addr: LinkAddr, header: Header, code: RequestCode) {
        let Some(conn) = self.registry.connection(handle) else {
            return;
        };
        if conn.exchange != Exchange::Idle || conn.outbound.is_some() {
            warn!(
                connection = %handle,
                pending = ?conn.exchange.request(),
                "Request while another exchange is in progress, disconnecting"
            );
            self.link.flush_unread(addr);
            return self.close(handle);
        }
        let handler = conn.handler.clone();

        let mut declared = header.information_length as usize;
        let mut acceptable_length = 0;
        if code == RequestCode::Get {
            if declared < ACCEPT_LENGTH_SIZE {
                warn!(connection = %handle, len = declared, "GET request without acceptable length");
                self.link.flush_unread(addr);
                return self.send_control(handle, ResponseCode::BadRequest);
            }
            let field = self.read_exact(addr, ACCEPT_LENGTH_SIZE);
            acceptable_length = match decode_accept_length(&field) {
                Ok(len) => len,
                Err(e) => {
                    warn!(connection = %handle, error = %e, "Truncated GET request");
                    self.link.flush_unread(addr);
                    return self.send_control(handle, ResponseCode::BadRequest);
                }
            };
            declared -= ACCEPT_LENGTH_SIZE;
        }

        let (buffer, capacity) = match handler.allocate(handle, code, declared) {
            Allocation::Granted { buffer, capacity } if capacity >= declared => (buffer, capacity),
            Allocation::Granted { capacity, .. } => {
                debug!(connection = %handle, declared, capacity, "Granted buffer too small");
                return self.decline(handle, addr, declared, None);
            }
            Allocation::Declined { code } => return self.decline(handle, addr, declared, code),
        };
        match Reassembly::new(buffer, capacity, declared) {
            Ok(reassembly) => self.start_reassembly(
                handle,
                addr,
                Inbound {
                    opcode: code as u8,
                    acceptable_length,
                    reassembly,
                },
            ),
            Err(e) => {
                debug!(connection = %handle, error = %e, "Buffer refused");
                self.decline(handle, addr, declared, None);
            }
        }
    }

    /// Refuse an inbound request. Without an application-supplied code the
    /// reply is REJECT when the message was going to arrive in several
    /// fragments and NOT_FOUND otherwise.
    fn decline(
        &mut self,
        handle: Handle,
        addr: LinkAddr,
        declared: usize,
        code: Option<ResponseCode>,
    ) {
        let pending = self.link.flush_unread(addr);
        let fragmented = declared > pending;
        let reply = code.filter(|c| c.is_final()).unwrap_or(if fragmented {
            ResponseCode::Reject
        } else {
            ResponseCode::NotFound
        });
        debug!(connection = %handle, declared, fragmented, ?reply, "Declining request");
        self.send_control(handle, reply);
    }

    /// Client side: a response-class opcode from the peer.
    fn on_response(&mut self, handle: Handle, addr: LinkAddr, header: Header, code: ResponseCode) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        let exchange = conn.exchange;
        if exchange == Exchange::Idle {
            warn!(connection = %handle, ?code, "Ignoring unsolicited response");
            self.link.flush_unread(addr);
            return;
        }

        match (code, exchange) {
            (ResponseCode::Continue, _) => {
                self.link.flush_unread(addr);
                if self.take_awaiting(handle, Side::Request) {
                    debug!(connection = %handle, "Peer ready, sending remaining fragments");
                    self.send_remaining(handle);
                } else {
                    warn!(connection = %handle, "Ignoring CONTINUE with nothing to continue");
                }
            }
            (
                ResponseCode::Success,
                Exchange::Get {
                    capacity,
                    acceptable_length,
                },
            ) => {
                conn.outbound = None;
                conn.awaiting_continue = None;
                conn.retained = None;

                let declared = header.information_length as usize;
                if declared > acceptable_length as usize {
                    debug!(
                        connection = %handle,
                        declared,
                        acceptable_length,
                        "Response exceeds acceptable length"
                    );
                    self.link.flush_unread(addr);
                    return self.finish_request(handle, ResponseCode::ExcessData, BytesMut::new());
                }
                match Reassembly::new(BytesMut::with_capacity(declared), capacity, declared) {
                    Ok(reassembly) => self.start_reassembly(
                        handle,
                        addr,
                        Inbound {
                            opcode: code as u8,
                            acceptable_length,
                            reassembly,
                        },
                    ),
                    Err(e) => {
                        debug!(connection = %handle, error = %e, "Response does not fit");
                        self.link.flush_unread(addr);
                        self.finish_request(handle, ResponseCode::ExcessData, BytesMut::new());
                    }
                }
            }
            (code, _) => {
                self.link.flush_unread(addr);
                self.finish_request(handle, code, BytesMut::new());
            }
        }
    }

    /// Clear `awaiting_continue` if it names `side`.
    fn take_awaiting(&mut self, handle: Handle, side: Side) -> bool {
        match self.registry.connection_mut(handle) {
            Some(conn) if conn.awaiting_continue == Some(side) => {
                conn.awaiting_continue = None;
                true
            }
            _ => false,
        }
    }

    /// Fill from the first fragment, then either dispatch or ask for more.
    fn start_reassembly(&mut self, handle: Handle, addr: LinkAddr, mut inbound: Inbound) {
        self.fill(addr, &mut inbound.reassembly);

        if inbound.reassembly.is_complete() {
            let surplus = self.link.flush_unread(addr);
            if surplus > 0 {
                debug!(connection = %handle, surplus, "Discarding bytes past declared length");
            }
            return self.dispatch(handle, inbound);
        }

        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        trace!(
            connection = %handle,
            received = inbound.reassembly.received(),
            declared = inbound.reassembly.declared(),
            "Reassembling"
        );
        let role = conn.role;
        conn.inbound = Some(inbound);
        match role {
            Role::Server => self.send_control(handle, ResponseCode::Continue),
            Role::Client => {
                self.send_control(handle, RequestCode::Continue);
                self.arm_response_timer(handle);
            }
        }
    }

    fn receive_continuation(&mut self, handle: Handle, addr: LinkAddr) {
        let Some(mut inbound) = self
            .registry
            .connection_mut(handle)
            .and_then(|c| c.inbound.take())
        else {
            return;
        };
        let more = self.fill(addr, &mut inbound.reassembly);
        let complete = inbound.reassembly.is_complete();

        if complete && !more {
            return self.dispatch(handle, inbound);
        }

        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        let role = conn.role;
        conn.inbound = Some(inbound);

        if complete {
            warn!(connection = %handle, "Bytes past declared length, disconnecting");
            self.link.flush_unread(addr);
            self.close(handle);
        } else if role == Role::Client {
            self.arm_response_timer(handle);
        }
    }

    /// Hand a complete inbound message to the application.
    fn dispatch(&mut self, handle: Handle, inbound: Inbound) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        let ndef = inbound.reassembly.into_buffer();
        debug!(connection = %handle, len = ndef.len(), opcode = inbound.opcode, "Message received");

        if conn.role == Role::Client {
            return self.finish_request(handle, ResponseCode::Success, ndef);
        }

        let handler = conn.handler.clone();
        let event = if inbound.opcode == RequestCode::Get as u8 {
            conn.exchange = Exchange::Get {
                capacity: 0,
                acceptable_length: inbound.acceptable_length,
            };
            ExchangeEvent::GetRequest {
                connection: handle,
                acceptable_length: inbound.acceptable_length,
                ndef,
            }
        } else {
            conn.exchange = Exchange::Put;
            ExchangeEvent::PutRequest {
                connection: handle,
                ndef,
            }
        };
        self.emit(handler, event);
    }

    /// End the client's pending request and report its outcome.
    fn finish_request(&mut self, handle: Handle, code: ResponseCode, ndef: BytesMut) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        let exchange = std::mem::replace(&mut conn.exchange, Exchange::Idle);
        conn.outbound = None;
        conn.retained = None;
        conn.awaiting_continue = None;
        conn.response_deadline = None;
        let handler = conn.handler.clone();

        let event = match exchange {
            Exchange::Idle => {
                debug!(connection = %handle, ?code, "No request pending");
                return;
            }
            Exchange::Get { .. } => ExchangeEvent::GetResponse {
                connection: handle,
                code,
                ndef,
            },
            Exchange::Put => ExchangeEvent::PutResponse {
                connection: handle,
                code,
            },
        };
        debug!(connection = %handle, ?code, "Request finished");
        self.emit(handler, event);
    }
}
