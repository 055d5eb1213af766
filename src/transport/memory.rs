//! In-memory data link pair.
//!
//! Two [`MemoryLink`] ends share one wire. PDUs sent on one end land in the
//! peer's receive queue, connects and disconnects are mirrored as events on
//! both ends, and every notification is delivered through
//! [`DataLink::poll_event`]. Clones of an end share its state, so a test can
//! keep a clone to inspect traffic or inject congestion and failures while an
//! engine owns the original.
//!
//! # Example
//!
//! ```
//! use snep_exchange::transport::memory::MemoryLink;
//! use snep_exchange::transport::{DataLink, LinkEvent};
//!
//! let (mut a, mut b) = MemoryLink::pair();
//! a.set_link_active(true);
//! assert_eq!(a.poll_event(), Some(LinkEvent::LinkStatus { activated: true }));
//! assert_eq!(b.poll_event(), Some(LinkEvent::LinkStatus { activated: true }));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::{
    ConnectFailure, DataLink, LinkAddr, LinkCapacity, LinkEvent, ReadResult, Sap, SendStatus,
};
use crate::error::{Result, SnepError};

/// First dynamically assigned server SAP.
const FIRST_SERVER_SAP: Sap = 0x10;

/// First dynamically assigned client SAP.
const FIRST_CLIENT_SAP: Sap = 0x20;

/// Parameters one end advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLinkConfig {
    /// Per-connection MIU advertised to the peer.
    pub miu: u16,
    /// Receive window advertised to the peer.
    pub rw: u8,
    /// Link-level MIU of this end.
    pub link_miu: u16,
}

impl Default for MemoryLinkConfig {
    fn default() -> Self {
        Self {
            miu: 128,
            rw: 1,
            link_miu: 128,
        }
    }
}

#[derive(Debug, Default)]
struct Channel {
    rx: VecDeque<Bytes>,
}

#[derive(Debug)]
struct End {
    config: MemoryLinkConfig,
    next_server_sap: Sap,
    next_client_sap: Sap,
    servers: Vec<(Sap, String)>,
    clients: Vec<Sap>,
    connections: HashMap<LinkAddr, Channel>,
    events: VecDeque<LinkEvent>,
    sent: Vec<(LinkAddr, Bytes)>,
    congested: bool,
    fail_sends: bool,
}

impl End {
    fn new(config: MemoryLinkConfig) -> Self {
        Self {
            config,
            next_server_sap: FIRST_SERVER_SAP,
            next_client_sap: FIRST_CLIENT_SAP,
            servers: Vec::new(),
            clients: Vec::new(),
            connections: HashMap::new(),
            events: VecDeque::new(),
            sent: Vec::new(),
            congested: false,
            fail_sends: false,
        }
    }

    fn sap_in_use(&self, sap: Sap) -> bool {
        self.servers.iter().any(|(s, _)| *s == sap) || self.clients.contains(&sap)
    }
}

#[derive(Debug)]
struct Wire {
    ends: [End; 2],
    active: bool,
}

/// One end of an in-memory data link.
#[derive(Debug, Clone)]
pub struct MemoryLink {
    wire: Arc<Mutex<Wire>>,
    end: usize,
}

impl MemoryLink {
    /// Create a connected pair with default parameters on both ends.
    pub fn pair() -> (Self, Self) {
        Self::pair_with(MemoryLinkConfig::default(), MemoryLinkConfig::default())
    }

    /// Create a connected pair with explicit parameters per end.
    pub fn pair_with(first: MemoryLinkConfig, second: MemoryLinkConfig) -> (Self, Self) {
        let wire = Arc::new(Mutex::new(Wire {
            ends: [End::new(first), End::new(second)],
            active: false,
        }));
        (
            Self {
                wire: wire.clone(),
                end: 0,
            },
            Self { wire, end: 1 },
        )
    }

    fn wire(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn peer(&self) -> usize {
        1 - self.end
    }

    /// Activate or deactivate the link. Both ends are notified; deactivation
    /// drops every connection without further events.
    pub fn set_link_active(&self, activated: bool) {
        let mut wire = self.wire();
        wire.active = activated;
        for end in wire.ends.iter_mut() {
            if !activated {
                end.connections.clear();
            }
            end.events.push_back(LinkEvent::LinkStatus { activated });
        }
    }

    /// Make subsequent sends on this end report `Congested`. Clearing it
    /// reports uncongestion on every open connection of this end.
    pub fn set_congested(&self, congested: bool) {
        let mut wire = self.wire();
        let end = &mut wire.ends[self.end];
        end.congested = congested;
        if !congested {
            let addrs: Vec<LinkAddr> = end.connections.keys().copied().collect();
            for addr in addrs {
                end.events.push_back(LinkEvent::Congestion {
                    addr,
                    congested: false,
                });
            }
        }
    }

    /// Make subsequent sends on this end fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.wire().ends[self.end].fail_sends = fail;
    }

    /// Take the log of PDUs this end has sent.
    pub fn take_sent(&self) -> Vec<(LinkAddr, Bytes)> {
        std::mem::take(&mut self.wire().ends[self.end].sent)
    }

    /// Number of PDUs this end has sent since the log was last taken.
    pub fn sent_count(&self) -> usize {
        self.wire().ends[self.end].sent.len()
    }

    /// Queue `pdu` on this end as if the peer had sent it.
    pub fn inject(&self, addr: LinkAddr, pdu: Bytes) {
        let mut wire = self.wire();
        let end = &mut wire.ends[self.end];
        end.connections.entry(addr).or_default().rx.push_back(pdu);
        end.events.push_back(LinkEvent::Data { addr });
    }

    /// Queue an arbitrary notification on this end.
    pub fn push_event(&self, event: LinkEvent) {
        self.wire().ends[self.end].events.push_back(event);
    }

    /// Bytes received on `addr` and not yet read.
    pub fn unread(&self, addr: LinkAddr) -> usize {
        self.wire().ends[self.end]
            .connections
            .get(&addr)
            .map(|c| c.rx.iter().map(Bytes::len).sum())
            .unwrap_or(0)
    }

    /// True if `addr` is an open connection on this end.
    pub fn is_connected(&self, addr: LinkAddr) -> bool {
        self.wire().ends[self.end].connections.contains_key(&addr)
    }

    /// Number of open connections on this end.
    pub fn connection_count(&self) -> usize {
        self.wire().ends[self.end].connections.len()
    }
}

impl DataLink for MemoryLink {
    fn register_server(&mut self, sap_hint: Option<Sap>, service_name: &str) -> Result<Sap> {
        let mut wire = self.wire();
        let end = &mut wire.ends[self.end];

        if end.servers.iter().any(|(_, name)| name == service_name) {
            return Err(SnepError::Transport(format!(
                "service name {service_name} already registered"
            )));
        }

        let sap = match sap_hint {
            Some(sap) if !end.sap_in_use(sap) => sap,
            _ => {
                while end.sap_in_use(end.next_server_sap) {
                    end.next_server_sap += 1;
                }
                if end.next_server_sap >= FIRST_CLIENT_SAP {
                    return Err(SnepError::Transport("no free server SAP".to_string()));
                }
                end.next_server_sap
            }
        };

        end.servers.push((sap, service_name.to_string()));
        Ok(sap)
    }

    fn register_client(&mut self) -> Result<Sap> {
        let mut wire = self.wire();
        let end = &mut wire.ends[self.end];

        while end.sap_in_use(end.next_client_sap) {
            end.next_client_sap = end.next_client_sap.wrapping_add(1);
        }
        if end.next_client_sap < FIRST_CLIENT_SAP || end.next_client_sap > 0x3F {
            return Err(SnepError::Transport("no free client SAP".to_string()));
        }

        let sap = end.next_client_sap;
        end.clients.push(sap);
        Ok(sap)
    }

    fn deregister(&mut self, sap: Sap) {
        let mut wire = self.wire();
        let end = &mut wire.ends[self.end];
        end.servers.retain(|(s, _)| *s != sap);
        end.clients.retain(|s| *s != sap);
    }

    fn connect(&mut self, local: Sap, service_name: &str) -> Result<()> {
        let (me, peer) = (self.end, self.peer());
        let mut wire = self.wire();

        if !wire.active {
            return Err(SnepError::Transport("link not active".to_string()));
        }

        let server = wire.ends[peer]
            .servers
            .iter()
            .find(|(_, name)| name == service_name)
            .map(|(sap, _)| *sap);

        match server {
            Some(remote) => {
                let config = wire.ends[me].config;
                wire.ends[peer].events.push_back(LinkEvent::ConnectIndication {
                    addr: LinkAddr::new(remote, local),
                    miu: config.miu,
                    rw: config.rw,
                });
            }
            None => wire.ends[me].events.push_back(LinkEvent::ConnectFailed {
                local,
                reason: ConnectFailure::NoService,
            }),
        }
        Ok(())
    }

    fn accept(&mut self, addr: LinkAddr) -> Result<()> {
        let (me, peer) = (self.end, self.peer());
        let mut wire = self.wire();

        if !wire.active {
            return Err(SnepError::Transport("link not active".to_string()));
        }

        let config = wire.ends[me].config;
        wire.ends[me].connections.insert(addr, Channel::default());
        wire.ends[peer]
            .connections
            .insert(addr.mirror(), Channel::default());
        wire.ends[peer].events.push_back(LinkEvent::ConnectResponse {
            addr: addr.mirror(),
            miu: config.miu,
            rw: config.rw,
        });
        Ok(())
    }

    fn reject(&mut self, addr: LinkAddr) {
        let peer = self.peer();
        self.wire().ends[peer]
            .events
            .push_back(LinkEvent::ConnectFailed {
                local: addr.remote,
                reason: ConnectFailure::Rejected,
            });
    }

    fn disconnect(&mut self, addr: LinkAddr, _flush: bool) {
        let (me, peer) = (self.end, self.peer());
        let mut wire = self.wire();

        if wire.ends[me].connections.remove(&addr).is_some()
            && wire.ends[peer].connections.remove(&addr.mirror()).is_some()
        {
            wire.ends[peer]
                .events
                .push_back(LinkEvent::DisconnectIndication {
                    addr: addr.mirror(),
                });
        }
        wire.ends[me]
            .events
            .push_back(LinkEvent::DisconnectResponse { addr });
    }

    fn send(&mut self, addr: LinkAddr, pdu: Bytes) -> SendStatus {
        let (me, peer) = (self.end, self.peer());
        let mut wire = self.wire();

        if wire.ends[me].fail_sends || !wire.ends[me].connections.contains_key(&addr) {
            return SendStatus::Fail;
        }
        let Some(channel) = wire.ends[peer].connections.get_mut(&addr.mirror()) else {
            return SendStatus::Fail;
        };

        channel.rx.push_back(pdu.clone());
        wire.ends[peer].events.push_back(LinkEvent::Data {
            addr: addr.mirror(),
        });
        wire.ends[me].sent.push((addr, pdu));

        if wire.ends[me].congested {
            SendStatus::Congested
        } else {
            SendStatus::Ok
        }
    }

    fn read(&mut self, addr: LinkAddr, max_len: usize) -> ReadResult {
        let mut wire = self.wire();
        let Some(channel) = wire.ends[self.end].connections.get_mut(&addr) else {
            return ReadResult::default();
        };

        let data = match channel.rx.front_mut() {
            None => Bytes::new(),
            Some(front) if front.len() <= max_len => channel.rx.pop_front().unwrap_or_default(),
            Some(front) => front.split_to(max_len),
        };
        let more = channel.rx.iter().any(|pdu| !pdu.is_empty());
        ReadResult { data, more }
    }

    fn flush_unread(&mut self, addr: LinkAddr) -> usize {
        let mut wire = self.wire();
        wire.ends[self.end]
            .connections
            .get_mut(&addr)
            .map(|c| c.rx.drain(..).map(|pdu| pdu.len()).sum())
            .unwrap_or(0)
    }

    fn set_send_complete_notify(&mut self, addr: LinkAddr) {
        self.wire().ends[self.end]
            .events
            .push_back(LinkEvent::SendComplete { addr });
    }

    fn link_capacity(&self) -> LinkCapacity {
        let wire = self.wire();
        LinkCapacity {
            local_miu: wire.ends[self.end].config.link_miu,
            remote_miu: wire.ends[self.peer()].config.link_miu,
        }
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        self.wire().ends[self.end].events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(link: &mut MemoryLink) -> Vec<LinkEvent> {
        std::iter::from_fn(|| link.poll_event()).collect()
    }

    /// Activate, register a server on `b`, connect from `a`, accept.
    fn connected() -> (MemoryLink, MemoryLink, LinkAddr) {
        let (mut a, mut b) = MemoryLink::pair();
        a.set_link_active(true);
        let server = b.register_server(Some(0x04), "svc").unwrap();
        let client = a.register_client().unwrap();
        a.connect(client, "svc").unwrap();
        drain(&mut a);

        let events = drain(&mut b);
        let addr = match events.last() {
            Some(LinkEvent::ConnectIndication { addr, .. }) => *addr,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(addr, LinkAddr::new(server, client));
        b.accept(addr).unwrap();
        (a, b, addr.mirror())
    }

    #[test]
    fn test_register_uses_hint_then_allocates() {
        let (mut a, _b) = MemoryLink::pair();
        assert_eq!(a.register_server(Some(0x04), "one").unwrap(), 0x04);
        assert_eq!(a.register_server(Some(0x04), "two").unwrap(), FIRST_SERVER_SAP);
        assert!(a.register_server(None, "one").is_err());
        assert_eq!(a.register_client().unwrap(), FIRST_CLIENT_SAP);
        assert_eq!(a.register_client().unwrap(), FIRST_CLIENT_SAP + 1);
    }

    #[test]
    fn test_connect_requires_active_link() {
        let (mut a, mut b) = MemoryLink::pair();
        b.register_server(None, "svc").unwrap();
        let client = a.register_client().unwrap();
        assert!(a.connect(client, "svc").is_err());
    }

    #[test]
    fn test_connect_unknown_service_fails() {
        let (mut a, _b) = MemoryLink::pair();
        a.set_link_active(true);
        drain(&mut a);
        let client = a.register_client().unwrap();
        a.connect(client, "missing").unwrap();
        assert_eq!(
            a.poll_event(),
            Some(LinkEvent::ConnectFailed {
                local: client,
                reason: ConnectFailure::NoService
            })
        );
    }

    #[test]
    fn test_accept_reports_connect_response() {
        let (mut a, _b, addr) = connected();
        assert_eq!(
            a.poll_event(),
            Some(LinkEvent::ConnectResponse {
                addr,
                miu: 128,
                rw: 1
            })
        );
        assert!(a.is_connected(addr));
    }

    #[test]
    fn test_send_read_and_split() {
        let (mut a, mut b, addr) = connected();
        drain(&mut b);

        assert_eq!(a.send(addr, Bytes::from_static(b"abcdef")), SendStatus::Ok);
        assert_eq!(a.sent_count(), 1);
        assert_eq!(b.poll_event(), Some(LinkEvent::Data { addr: addr.mirror() }));

        let first = b.read(addr.mirror(), 4);
        assert_eq!(&first.data[..], b"abcd");
        assert!(first.more);

        let rest = b.read(addr.mirror(), 4);
        assert_eq!(&rest.data[..], b"ef");
        assert!(!rest.more);
    }

    #[test]
    fn test_flush_unread_counts_bytes() {
        let (mut a, mut b, addr) = connected();
        a.send(addr, Bytes::from_static(b"123"));
        a.send(addr, Bytes::from_static(b"4567"));
        assert_eq!(b.unread(addr.mirror()), 7);
        assert_eq!(b.flush_unread(addr.mirror()), 7);
        assert_eq!(b.unread(addr.mirror()), 0);
    }

    #[test]
    fn test_congestion_and_failure() {
        let (mut a, _b, addr) = connected();
        drain(&mut a);

        a.set_congested(true);
        assert_eq!(a.send(addr, Bytes::from_static(b"x")), SendStatus::Congested);
        a.set_congested(false);
        assert_eq!(
            a.poll_event(),
            Some(LinkEvent::Congestion {
                addr,
                congested: false
            })
        );

        a.set_fail_sends(true);
        assert_eq!(a.send(addr, Bytes::from_static(b"x")), SendStatus::Fail);
    }

    #[test]
    fn test_disconnect_notifies_both_ends() {
        let (mut a, mut b, addr) = connected();
        drain(&mut a);
        drain(&mut b);

        a.disconnect(addr, false);
        assert_eq!(a.poll_event(), Some(LinkEvent::DisconnectResponse { addr }));
        assert_eq!(
            b.poll_event(),
            Some(LinkEvent::DisconnectIndication { addr: addr.mirror() })
        );
        assert_eq!(a.send(addr, Bytes::from_static(b"x")), SendStatus::Fail);
    }

    #[test]
    fn test_deactivation_drops_connections() {
        let (a, b, addr) = connected();
        a.set_link_active(false);
        assert!(!a.is_connected(addr));
        assert_eq!(b.connection_count(), 0);
    }

    #[test]
    fn test_link_capacity_reports_both_ends() {
        let (a, _b) = MemoryLink::pair_with(
            MemoryLinkConfig {
                link_miu: 248,
                ..Default::default()
            },
            MemoryLinkConfig {
                link_miu: 1024,
                ..Default::default()
            },
        );
        assert_eq!(
            a.link_capacity(),
            LinkCapacity {
                local_miu: 248,
                remote_miu: 1024
            }
        );
    }
}
