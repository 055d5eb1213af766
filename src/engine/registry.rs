//! Connection registry.
//!
//! A fixed-capacity arena of records. Slots are allocated first-fit and
//! never grow. Every slot carries a generation counter that is bumped when
//! the slot is freed, so a [`Handle`] to a freed record stops resolving even
//! after the slot is reused.

use std::fmt;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::{Result, SnepError};
use crate::handler::SharedHandler;
use crate::protocol::{OutboundMessage, Reassembly, RequestCode, Role};
use crate::transport::{LinkAddr, Sap};

/// Opaque reference to a registration or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u16,
    generation: u32,
}

impl Handle {
    pub(crate) fn new(index: u16, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the arena.
    #[inline]
    pub fn index(&self) -> usize {
        usize::from(self.index)
    }

    /// Generation of the slot when this handle was issued.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Where a record is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// A registration, listening or idle.
    Registered,
    /// A client connect is in flight.
    Connecting,
    /// The data-link connection is up.
    Connected,
    /// A local disconnect is in flight.
    Disconnecting,
}

/// Which party of a fragmented transfer is waiting for a CONTINUE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// A request is paused (client sending).
    Request,
    /// A response is paused (server sending).
    Response,
}

/// The request a connection is currently servicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exchange {
    Idle,
    /// Client: GET sent, response pending. Server: GET dispatched, the
    /// application's response pending.
    Get {
        capacity: usize,
        acceptable_length: u32,
    },
    /// Client: PUT sent, response pending. Server: PUT dispatched.
    Put,
}

impl Exchange {
    pub(crate) fn request(&self) -> Option<RequestCode> {
        match self {
            Self::Idle => None,
            Self::Get { .. } => Some(RequestCode::Get),
            Self::Put => Some(RequestCode::Put),
        }
    }
}

/// A listening server or an idle client template.
pub(crate) struct Registration {
    pub(crate) sap: Option<Sap>,
    pub(crate) role: Role,
    pub(crate) handler: SharedHandler,
    pub(crate) deregistering: bool,
    /// Connects issued on this SAP and abandoned before the link answered.
    /// The link completes connects in issue order, so the next this many
    /// completions belong to them.
    pub(crate) stale_connects: u32,
}

/// Inbound message under reassembly, with the request it belongs to.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub(crate) opcode: u8,
    pub(crate) acceptable_length: u32,
    pub(crate) reassembly: Reassembly,
}

/// One data-link connection and its exchange state.
pub(crate) struct Connection {
    pub(crate) registration: Handle,
    pub(crate) handler: SharedHandler,
    pub(crate) role: Role,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) local: Sap,
    /// `None` while a client is connecting.
    pub(crate) remote: Option<Sap>,
    /// The link was asked to connect and has not answered yet.
    pub(crate) connect_issued: bool,
    pub(crate) miu: usize,
    pub(crate) rx_code: Option<u8>,
    pub(crate) exchange: Exchange,
    pub(crate) outbound: Option<OutboundMessage>,
    /// Payload of a fully sent message: a client request until its response
    /// arrives, a GET response until the link confirms delivery.
    pub(crate) retained: Option<Bytes>,
    /// The outbound message answers a GET request.
    pub(crate) get_response: bool,
    pub(crate) inbound: Option<Inbound>,
    pub(crate) awaiting_continue: Option<Side>,
    pub(crate) congested: bool,
    pub(crate) response_deadline: Option<Instant>,
}

impl Connection {
    pub(crate) fn new(
        registration: Handle,
        handler: SharedHandler,
        role: Role,
        lifecycle: Lifecycle,
        local: Sap,
        remote: Option<Sap>,
    ) -> Self {
        Self {
            registration,
            handler,
            role,
            lifecycle,
            local,
            remote,
            connect_issued: false,
            miu: 0,
            rx_code: None,
            exchange: Exchange::Idle,
            outbound: None,
            retained: None,
            get_response: false,
            inbound: None,
            awaiting_continue: None,
            congested: false,
            response_deadline: None,
        }
    }

    /// Link address, once the peer is known.
    #[inline]
    pub(crate) fn addr(&self) -> Option<LinkAddr> {
        self.remote.map(|remote| LinkAddr::new(self.local, remote))
    }

    /// True while a request or response is being transmitted or received.
    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.outbound.is_some() || self.inbound.is_some()
    }
}

/// A record in the arena.
pub(crate) enum Record {
    Registration(Registration),
    Connection(Connection),
}

struct Slot {
    generation: u32,
    record: Option<Record>,
}

/// Fixed-capacity arena of records.
pub(crate) struct Registry {
    slots: Vec<Slot>,
}

impl Registry {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity.min(usize::from(u16::MAX)))
            .map(|_| Slot {
                generation: 0,
                record: None,
            })
            .collect();
        Self { slots }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live records.
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    /// Store `record` in the first free slot.
    pub(crate) fn insert(&mut self, record: Record) -> Result<Handle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.record.is_none())
            .ok_or(SnepError::ResourceExhausted)?;
        slot.record = Some(record);
        Ok(Handle::new(index as u16, slot.generation))
    }

    /// Free the slot and invalidate every handle to it.
    pub(crate) fn remove(&mut self, handle: Handle) -> Option<Record> {
        let slot = self.slot_mut(handle)?;
        let record = slot.record.take();
        slot.generation = slot.generation.wrapping_add(1);
        record
    }

    pub(crate) fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&Record> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation && slot.record.is_some())
    }

    pub(crate) fn registration(&self, handle: Handle) -> Option<&Registration> {
        match self.get(handle)? {
            Record::Registration(r) => Some(r),
            Record::Connection(_) => None,
        }
    }

    pub(crate) fn registration_mut(&mut self, handle: Handle) -> Option<&mut Registration> {
        match self.slot_mut(handle)?.record.as_mut()? {
            Record::Registration(r) => Some(r),
            Record::Connection(_) => None,
        }
    }

    pub(crate) fn connection(&self, handle: Handle) -> Option<&Connection> {
        match self.get(handle)? {
            Record::Connection(c) => Some(c),
            Record::Registration(_) => None,
        }
    }

    pub(crate) fn connection_mut(&mut self, handle: Handle) -> Option<&mut Connection> {
        match self.slot_mut(handle)?.record.as_mut()? {
            Record::Connection(c) => Some(c),
            Record::Registration(_) => None,
        }
    }

    /// Handles of every live record, in slot order.
    pub(crate) fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.record.is_some())
            .map(|(i, slot)| Handle::new(i as u16, slot.generation))
            .collect()
    }

    /// Handles of every live connection.
    pub(crate) fn connections(&self) -> Vec<Handle> {
        self.handles()
            .into_iter()
            .filter(|h| self.connection(*h).is_some())
            .collect()
    }

    /// Connection matching `local` and `remote`, where `None` matches a
    /// connection whose peer is not known yet.
    pub(crate) fn find_connection(&self, local: Sap, remote: Option<Sap>) -> Option<Handle> {
        self.connections().into_iter().find(|h| {
            self.connection(*h)
                .is_some_and(|c| c.local == local && c.remote == remote)
        })
    }

    /// Registration listening on `sap` with `role`.
    pub(crate) fn find_registration(&self, sap: Sap, role: Role) -> Option<Handle> {
        self.handles().into_iter().find(|h| {
            self.registration(*h)
                .is_some_and(|r| r.sap == Some(sap) && r.role == role)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::ExchangeApi;
    use crate::handler::{ExchangeEvent, ExchangeHandler};

    struct Noop;

    impl ExchangeHandler for Noop {
        fn on_event(&self, _event: ExchangeEvent, _api: &mut dyn ExchangeApi) {}
    }

    fn registration(sap: Sap, role: Role) -> Record {
        Record::Registration(Registration {
            sap: Some(sap),
            role,
            handler: Arc::new(Noop),
            deregistering: false,
            stale_connects: 0,
        })
    }

    fn connection(parent: Handle, local: Sap, remote: Option<Sap>) -> Record {
        Record::Connection(Connection::new(
            parent,
            Arc::new(Noop),
            Role::Client,
            Lifecycle::Connecting,
            local,
            remote,
        ))
    }

    #[test]
    fn test_first_fit_and_exhaustion() {
        let mut registry = Registry::with_capacity(2);
        let a = registry.insert(registration(0x04, Role::Server)).unwrap();
        let b = registry.insert(registration(0x20, Role::Client)).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(matches!(
            registry.insert(registration(0x21, Role::Client)),
            Err(SnepError::ResourceExhausted)
        ));

        registry.remove(a);
        let c = registry.insert(registration(0x22, Role::Client)).unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut registry = Registry::with_capacity(1);
        let old = registry.insert(registration(0x04, Role::Server)).unwrap();
        assert!(registry.remove(old).is_some());
        let new = registry.insert(registration(0x05, Role::Server)).unwrap();

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(!registry.contains(old));
        assert!(registry.get(old).is_none());
        assert!(registry.remove(old).is_none());
        assert!(registry.contains(new));
    }

    #[test]
    fn test_typed_lookup() {
        let mut registry = Registry::with_capacity(4);
        let reg = registry.insert(registration(0x20, Role::Client)).unwrap();
        let conn = registry.insert(connection(reg, 0x20, None)).unwrap();

        assert!(registry.registration(reg).is_some());
        assert!(registry.connection(reg).is_none());
        assert!(registry.connection(conn).is_some());
        assert!(registry.registration_mut(conn).is_none());
        assert_eq!(registry.connections(), vec![conn]);
    }

    #[test]
    fn test_find_by_address_with_wildcard() {
        let mut registry = Registry::with_capacity(4);
        let reg = registry.insert(registration(0x20, Role::Client)).unwrap();
        let pending = registry.insert(connection(reg, 0x20, None)).unwrap();
        let live = registry.insert(connection(reg, 0x21, Some(0x04))).unwrap();

        assert_eq!(registry.find_connection(0x20, None), Some(pending));
        assert_eq!(registry.find_connection(0x21, Some(0x04)), Some(live));
        assert_eq!(registry.find_connection(0x21, Some(0x05)), None);
        assert_eq!(registry.find_registration(0x20, Role::Client), Some(reg));
        assert_eq!(registry.find_registration(0x20, Role::Server), None);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(Handle::new(3, 7).to_string(), "#3.7");
    }
}
