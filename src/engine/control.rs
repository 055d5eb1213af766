//! Connection state controller.
//!
//! Executes posted registration, connect and disconnect calls and routes
//! every data-link event to the record it concerns. Records are freed here
//! and nowhere else, so each connection reports `Disconnected` exactly once.

use tracing::{debug, trace, warn};

use super::registry::{Connection, Handle, Lifecycle, Record};
use super::Engine;
use crate::error::SnepError;
use crate::handler::{ExchangeEvent, Reclaimed, SharedHandler};
use crate::protocol::{efficient_miu, OutboundMessage, RequestCode, ResponseCode, Role};
use crate::transport::{ConnectFailure, DataLink, LinkAddr, LinkEvent, Sap};

impl<L: DataLink> Engine<L> {
    pub(super) fn execute_register_server(
        &mut self,
        registration: Handle,
        sap_hint: Option<Sap>,
        service_name: String,
    ) {
        if !self.registry.contains(registration) {
            return;
        }
        match self.link.register_server(sap_hint, &service_name) {
            Ok(sap) => {
                let Some(record) = self.registry.registration_mut(registration) else {
                    return;
                };
                record.sap = Some(sap);
                let handler = record.handler.clone();
                debug!(%registration, sap, service_name, "Server registered");
                self.emit(
                    handler,
                    ExchangeEvent::Registered {
                        registration,
                        service_name: Some(service_name),
                    },
                );
            }
            Err(e) => self.fail_registration(registration, e),
        }
    }

    pub(super) fn execute_register_client(&mut self, registration: Handle) {
        if !self.registry.contains(registration) {
            return;
        }
        match self.link.register_client() {
            Ok(sap) => {
                let Some(record) = self.registry.registration_mut(registration) else {
                    return;
                };
                record.sap = Some(sap);
                let handler = record.handler.clone();
                debug!(%registration, sap, "Client registered");
                self.emit(
                    handler.clone(),
                    ExchangeEvent::Registered {
                        registration,
                        service_name: None,
                    },
                );
                if self.link_active {
                    self.emit(handler, ExchangeEvent::LinkActivated { registration });
                }
            }
            Err(e) => self.fail_registration(registration, e),
        }
    }

    fn fail_registration(&mut self, registration: Handle, error: SnepError) {
        warn!(%registration, %error, "Registration failed");
        if let Some(Record::Registration(record)) = self.registry.remove(registration) {
            self.emit(
                record.handler,
                ExchangeEvent::RegistrationFailed {
                    registration,
                    reason: error.to_string(),
                },
            );
        }
    }

    pub(super) fn execute_deregister(&mut self, registration: Handle) {
        let children: Vec<Handle> = self
            .registry
            .connections()
            .into_iter()
            .filter(|h| {
                self.registry
                    .connection(*h)
                    .is_some_and(|c| c.registration == registration)
            })
            .collect();
        for child in children {
            self.close(child);
        }

        if let Some(Record::Registration(record)) = self.registry.remove(registration) {
            if let Some(sap) = record.sap {
                self.link.deregister(sap);
            }
            debug!(%registration, sap = ?record.sap, "Deregistered");
        }
    }

    pub(super) fn execute_connect(&mut self, connection: Handle, service_name: &str) {
        let Some(conn) = self
            .registry
            .connection(connection)
            .filter(|c| c.lifecycle == Lifecycle::Connecting)
        else {
            debug!(%connection, "Connect abandoned before it was posted");
            return;
        };
        let local = conn.local;
        debug!(%connection, local, service_name, "Connecting");
        match self.link.connect(local, service_name) {
            Ok(()) => {
                if let Some(conn) = self.registry.connection_mut(connection) {
                    conn.connect_issued = true;
                }
            }
            Err(e) => {
                warn!(%connection, error = %e, "Connect refused by transport");
                self.finalize(connection);
            }
        }
    }

    pub(super) fn execute_disconnect(&mut self, connection: Handle, flush: bool) {
        let Some(conn) = self.registry.connection(connection) else {
            return;
        };
        match conn.addr() {
            Some(addr) => {
                debug!(%connection, %addr, flush, "Disconnecting");
                self.link.disconnect(addr, flush);
            }
            None => self.finalize(connection),
        }
    }

    /// Tear a connection down from the local side, whatever its state.
    pub(super) fn close(&mut self, handle: Handle) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        match conn.lifecycle {
            Lifecycle::Disconnecting => {}
            Lifecycle::Connecting | Lifecycle::Registered => self.finalize(handle),
            Lifecycle::Connected => {
                conn.lifecycle = Lifecycle::Disconnecting;
                conn.response_deadline = None;
                match conn.addr() {
                    Some(addr) => {
                        debug!(connection = %handle, %addr, "Closing connection");
                        self.link.disconnect(addr, false);
                    }
                    None => self.finalize(handle),
                }
            }
        }
    }

    /// Free the record and report `Disconnected` with whatever buffers it
    /// still owned.
    pub(super) fn finalize(&mut self, handle: Handle) {
        let Some(Record::Connection(conn)) = self.registry.remove(handle) else {
            return;
        };
        if conn.connect_issued && self.link_active {
            if let Some(registration) = self.registry.registration_mut(conn.registration) {
                registration.stale_connects += 1;
            }
        }
        let reclaimed = Reclaimed {
            outbound: conn.outbound.map(OutboundMessage::into_ndef).or(conn.retained),
            inbound: conn.inbound.map(|i| i.reassembly.into_buffer()),
        };
        debug!(
            connection = %handle,
            addr = ?conn.remote.map(|r| LinkAddr::new(conn.local, r)),
            outbound = reclaimed.outbound.is_some(),
            inbound = reclaimed.inbound.is_some(),
            "Connection closed"
        );
        self.emit(
            conn.handler,
            ExchangeEvent::Disconnected {
                connection: handle,
                reclaimed,
            },
        );
    }

    pub(super) fn on_response_timeout(&mut self, handle: Handle) {
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        warn!(connection = %handle, "Response timeout, disconnecting");
        conn.response_deadline = None;
        self.close(handle);
    }

    pub(super) fn process_link_event(&mut self, event: LinkEvent) {
        trace!(?event, "Link event");
        match event {
            LinkEvent::LinkStatus { activated } => self.on_link_status(activated),
            LinkEvent::ConnectIndication { addr, miu, rw } => {
                self.on_connect_indication(addr, miu, rw)
            }
            LinkEvent::ConnectResponse { addr, miu, rw } => self.on_connect_response(addr, miu, rw),
            LinkEvent::ConnectFailed { local, reason } => self.on_connect_failed(local, reason),
            LinkEvent::DisconnectIndication { addr } | LinkEvent::DisconnectResponse { addr } => {
                match self.lookup(addr) {
                    Some(handle) => self.finalize(handle),
                    None => trace!(%addr, "Disconnect for unknown connection"),
                }
            }
            LinkEvent::Congestion { addr, congested } => self.on_congestion(addr, congested),
            LinkEvent::Data { addr } => match self.lookup(addr) {
                Some(handle) => self.on_data(handle),
                None => {
                    let dropped = self.link.flush_unread(addr);
                    debug!(%addr, dropped, "Data for unknown connection");
                }
            },
            LinkEvent::SendComplete { addr } => self.on_send_complete(addr),
        }
    }

    fn lookup(&self, addr: LinkAddr) -> Option<Handle> {
        self.registry.find_connection(addr.local, Some(addr.remote))
    }

    fn negotiate_miu(&self, peer_miu: u16, peer_rw: u8) -> usize {
        let capacity = self.link.link_capacity();
        usize::from(efficient_miu(capacity.remote_miu, peer_miu, peer_rw))
    }

    fn client_registrations(&self) -> Vec<(Handle, SharedHandler)> {
        self.registry
            .handles()
            .into_iter()
            .filter_map(|h| {
                let r = self.registry.registration(h)?;
                (r.role == Role::Client && r.sap.is_some()).then(|| (h, r.handler.clone()))
            })
            .collect()
    }

    fn on_link_status(&mut self, activated: bool) {
        if activated == self.link_active {
            trace!(activated, "Link status unchanged");
            return;
        }
        self.link_active = activated;

        if activated {
            debug!("Link activated");
            for (registration, handler) in self.client_registrations() {
                self.emit(handler, ExchangeEvent::LinkActivated { registration });
            }
            return;
        }

        warn!("Link deactivated, dropping all connections");
        for handle in self.registry.connections() {
            self.finalize(handle);
        }
        for handle in self.registry.handles() {
            if let Some(registration) = self.registry.registration_mut(handle) {
                registration.stale_connects = 0;
            }
        }
        for (registration, handler) in self.client_registrations() {
            self.emit(handler, ExchangeEvent::LinkDeactivated { registration });
        }
    }

    fn on_connect_indication(&mut self, addr: LinkAddr, miu: u16, rw: u8) {
        let Some((registration, handler)) = self
            .registry
            .find_registration(addr.local, Role::Server)
            .and_then(|h| {
                let r = self.registry.registration(h)?;
                (!r.deregistering).then(|| (h, r.handler.clone()))
            })
        else {
            debug!(%addr, "No server listening, rejecting");
            self.link.reject(addr);
            return;
        };
        if self.lookup(addr).is_some() {
            warn!(%addr, "Duplicate connect indication, rejecting");
            self.link.reject(addr);
            return;
        }

        let mut conn = Connection::new(
            registration,
            handler.clone(),
            Role::Server,
            Lifecycle::Connected,
            addr.local,
            Some(addr.remote),
        );
        conn.miu = self.negotiate_miu(miu, rw);
        let negotiated = conn.miu;

        let connection = match self.registry.insert(Record::Connection(conn)) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%addr, error = %e, "Rejecting connection");
                self.link.reject(addr);
                return;
            }
        };
        if let Err(e) = self.link.accept(addr) {
            warn!(%addr, error = %e, "Accept failed");
            self.registry.remove(connection);
            return;
        }

        debug!(%connection, %addr, miu = negotiated, "Accepted connection");
        self.emit(
            handler,
            ExchangeEvent::Connected {
                registration,
                connection,
                role: Role::Server,
            },
        );
    }

    /// Consume one abandoned connect on the client registration at `local`.
    fn take_stale_connect(&mut self, local: Sap) -> bool {
        let Some(registration) = self
            .registry
            .find_registration(local, Role::Client)
            .and_then(|h| self.registry.registration_mut(h))
        else {
            return false;
        };
        if registration.stale_connects == 0 {
            return false;
        }
        registration.stale_connects -= 1;
        true
    }

    fn on_connect_response(&mut self, addr: LinkAddr, miu: u16, rw: u8) {
        let pending = if self.take_stale_connect(addr.local) {
            None
        } else {
            self.registry.find_connection(addr.local, None)
        };
        let Some(connection) = pending else {
            debug!(%addr, "Connect confirmed after it was abandoned, disconnecting");
            self.link.disconnect(addr, false);
            return;
        };
        let negotiated = self.negotiate_miu(miu, rw);
        let Some(conn) = self.registry.connection_mut(connection) else {
            return;
        };
        conn.remote = Some(addr.remote);
        conn.connect_issued = false;
        conn.lifecycle = Lifecycle::Connected;
        conn.miu = negotiated;
        let registration = conn.registration;
        let handler = conn.handler.clone();

        debug!(%connection, %addr, miu = negotiated, "Connected");
        self.emit(
            handler,
            ExchangeEvent::Connected {
                registration,
                connection,
                role: Role::Client,
            },
        );
    }

    fn on_connect_failed(&mut self, local: Sap, reason: ConnectFailure) {
        if self.take_stale_connect(local) {
            debug!(local, ?reason, "Abandoned connect failed");
            return;
        }
        match self.registry.find_connection(local, None) {
            Some(connection) => {
                warn!(%connection, local, ?reason, "Connect failed");
                if let Some(conn) = self.registry.connection_mut(connection) {
                    conn.connect_issued = false;
                }
                self.finalize(connection);
            }
            None => trace!(local, ?reason, "Connect failure for unknown connection"),
        }
    }

    fn on_congestion(&mut self, addr: LinkAddr, congested: bool) {
        let Some(handle) = self.lookup(addr) else {
            return;
        };
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        conn.congested = congested;
        trace!(connection = %handle, congested, "Congestion changed");

        let peer_continue = match conn.role {
            Role::Server => RequestCode::Continue as u8,
            Role::Client => ResponseCode::Continue as u8,
        };
        let resume = !congested
            && conn.outbound.is_some()
            && conn.awaiting_continue.is_none()
            && conn.rx_code == Some(peer_continue);
        if resume {
            debug!(connection = %handle, "Congestion cleared, resuming");
            self.send_remaining(handle);
        }
    }

    fn on_send_complete(&mut self, addr: LinkAddr) {
        let Some(handle) = self.lookup(addr) else {
            return;
        };
        let Some(conn) = self.registry.connection_mut(handle) else {
            return;
        };
        if conn.role != Role::Server {
            return;
        }
        if let Some(buffer) = conn.retained.take() {
            let handler = conn.handler.clone();
            debug!(connection = %handle, len = buffer.len(), "GET response delivered");
            self.emit(
                handler,
                ExchangeEvent::GetResponseSendComplete {
                    connection: handle,
                    buffer,
                },
            );
        }
    }
}
