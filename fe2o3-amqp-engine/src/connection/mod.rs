//! Connection endpoint and the arenas of its sessions, links and deliveries

use std::collections::{HashMap, VecDeque};

use serde_amqp::primitives::Symbol;
use slab::Slab;

use crate::{
    delivery::Delivery,
    endpoint::{ConnectionId, DeliveryId, EndpointState, LinkId, LocalState, SessionId},
    error::Error,
    event::{Collector, Event, EventType},
    link::Link,
    session::{Session, SessionDefaults},
    transport::Transport,
    types::{definitions::Fields, performatives::Open, Condition},
};

mod builder;

pub use builder::Builder;

/// A full-duplex sequence of frames between two containers
///
/// The connection owns its sessions, links and deliveries. They are addressed by
/// the typed ids handed out when they are created.
#[derive(Debug)]
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) state: EndpointState,
    pub(crate) condition: Option<Condition>,
    pub(crate) remote_condition: Option<Condition>,

    pub(crate) container_id: String,
    pub(crate) hostname: Option<String>,
    pub(crate) offered_capabilities: Option<Vec<Symbol>>,
    pub(crate) desired_capabilities: Option<Vec<Symbol>>,
    pub(crate) properties: Option<Fields>,
    pub(crate) remote_open: Option<Open>,

    pub(crate) sessions: Slab<Session>,
    pub(crate) links: Slab<Link>,
    pub(crate) deliveries: HashMap<DeliveryId, Delivery>,
    pub(crate) next_delivery_id: u64,
    pub(crate) work_list: VecDeque<DeliveryId>,
    pub(crate) tpwork: VecDeque<DeliveryId>,
    pub(crate) session_defaults: SessionDefaults,

    pub(crate) transport: Option<Transport>,
    pub(crate) bound: bool,
    pub(crate) collector: Option<Collector>,
    pub(crate) final_emitted: bool,
}

impl Connection {
    /// Creates a connection with default settings
    pub fn new(container_id: impl Into<String>) -> Self {
        Builder::new().container_id(container_id).build()
    }

    /// Creates a builder for [`Connection`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Id of the connection within its reactor
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Endpoint state
    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Local error condition
    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Error condition sent by the peer with its close
    pub fn remote_condition(&self) -> Option<&Condition> {
        self.remote_condition.as_ref()
    }

    /// Local container id
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Hostname sent in the open
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Sets the hostname sent in the open
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    /// Capabilities offered to the peer
    pub fn offered_capabilities(&self) -> Option<&[Symbol]> {
        self.offered_capabilities.as_deref()
    }

    /// Capabilities desired from the peer
    pub fn desired_capabilities(&self) -> Option<&[Symbol]> {
        self.desired_capabilities.as_deref()
    }

    /// Connection properties sent in the open
    pub fn properties(&self) -> Option<&Fields> {
        self.properties.as_ref()
    }

    /// Container id of the peer
    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote_open.as_ref().map(|open| open.container_id.as_str())
    }

    /// Hostname the peer sent
    pub fn remote_hostname(&self) -> Option<&str> {
        self.remote_open.as_ref().and_then(|open| open.hostname.as_deref())
    }

    /// Capabilities the peer offered
    pub fn remote_offered_capabilities(&self) -> Option<&[Symbol]> {
        self.remote_open
            .as_ref()
            .and_then(|open| open.offered_capabilities.as_ref())
            .map(|caps| caps.0.as_slice())
    }

    /// Capabilities the peer desired
    pub fn remote_desired_capabilities(&self) -> Option<&[Symbol]> {
        self.remote_open
            .as_ref()
            .and_then(|open| open.desired_capabilities.as_ref())
            .map(|caps| caps.0.as_slice())
    }

    /// Properties the peer sent
    pub fn remote_properties(&self) -> Option<&Fields> {
        self.remote_open.as_ref().and_then(|open| open.properties.as_ref())
    }

    /// Opens the local end of the connection
    pub fn open(&mut self) {
        if self.state.set_local(LocalState::Active) {
            #[cfg(feature = "tracing")]
            tracing::debug!(id = ?self.id, "local open");
            #[cfg(feature = "log")]
            log::debug!("local open id={:?}", self.id);

            self.emit(Event::connection(EventType::ConnectionLocalOpen, self.id));
        }
    }

    /// Closes the local end of the connection. The condition is only recorded if
    /// there is none yet.
    pub fn close(&mut self, condition: Option<Condition>) {
        if self.condition.is_none() {
            self.condition = condition;
        }
        if self.state.set_local(LocalState::Closed) {
            #[cfg(feature = "tracing")]
            tracing::debug!(id = ?self.id, condition = ?self.condition, "local close");
            #[cfg(feature = "log")]
            log::debug!("local close id={:?} condition={:?}", self.id, self.condition);

            self.emit(Event::connection(EventType::ConnectionLocalClose, self.id));
        }
    }

    /// Starts recording events into a collector
    pub fn collect(&mut self, collector: Collector) {
        self.collector = Some(collector);
        self.emit(Event::connection(EventType::ConnectionInit, self.id));
    }

    /// The collector events are recorded into
    pub fn collector(&self) -> Option<&Collector> {
        self.collector.as_ref()
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(collector) = &self.collector {
            collector.put(event);
        }
    }

    /// Binds a transport. A connection is bound at most once.
    pub fn bind(&mut self, transport: Transport) -> Result<(), Error> {
        if self.bound {
            return Err(Error::IllegalState("connection is already bound to a transport"));
        }
        self.transport = Some(transport);
        self.bound = true;
        self.emit(Event::connection(EventType::ConnectionBound, self.id));
        Ok(())
    }

    /// Unbinds and returns the transport
    pub fn unbind(&mut self) -> Option<Transport> {
        if !self.bound {
            return None;
        }
        self.bound = false;
        self.emit(Event::connection(EventType::ConnectionUnbound, self.id));
        self.transport.take()
    }

    /// Whether a transport is bound
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The bound transport
    pub fn transport(&self) -> Option<&Transport> {
        match self.bound {
            true => self.transport.as_ref(),
            false => None,
        }
    }

    /// The transport, bound on first use
    pub fn transport_mut(&mut self) -> &mut Transport {
        if !self.bound {
            self.bound = true;
            self.emit(Event::connection(EventType::ConnectionBound, self.id));
        }
        self.transport.get_or_insert_with(Transport::new)
    }

    /// First session whose state matches `mask`
    pub fn session_head(&self, mask: EndpointState) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.state.matches(mask))
            .map(|(key, _)| SessionId(key))
    }

    /// Next session after `session` whose state matches `mask`
    pub fn session_next(&self, session: SessionId, mask: EndpointState) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(key, s)| *key > session.0 && s.state.matches(mask))
            .map(|(key, _)| SessionId(key))
    }

    /// First link whose state matches `mask`
    pub fn link_head(&self, mask: EndpointState) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(_, l)| l.state.matches(mask))
            .map(|(key, _)| LinkId(key))
    }

    /// Next link after `link` whose state matches `mask`
    pub fn link_next(&self, link: LinkId, mask: EndpointState) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(key, l)| *key > link.0 && l.state.matches(mask))
            .map(|(key, _)| LinkId(key))
    }

    /// Frees finished links and sessions, and settled deliveries the peer no longer
    /// needs to hear about.
    ///
    /// Ids of freed entities stop resolving. Session and link ids may be handed out
    /// again afterwards, delivery ids never are.
    pub fn reclaim(&mut self) {
        let dead_links: Vec<usize> = self
            .links
            .iter()
            .filter(|(_, l)| l.final_emitted)
            .map(|(key, _)| key)
            .collect();
        for key in dead_links {
            // The session of a delivery is found through its link
            let deliveries: Vec<DeliveryId> = self.links[key].deliveries.iter().copied().collect();
            for id in deliveries {
                self.remove_delivery(id);
            }
            let link = self.links.remove(key);
            if let Some(s) = self.sessions.get_mut(link.session.0) {
                s.links.retain(|l| l.0 != key);
            }
        }

        let dead_sessions: Vec<usize> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.final_emitted && s.links.is_empty())
            .map(|(key, _)| key)
            .collect();
        for key in dead_sessions {
            self.sessions.remove(key);
        }

        let settled: Vec<DeliveryId> = self
            .deliveries
            .values()
            .filter(|d| self.is_delivery_reclaimable(d))
            .map(|d| d.id)
            .collect();
        for id in settled {
            if let Some(d) = self.deliveries.get(&id) {
                if let Some(l) = self.links.get_mut(d.link.0) {
                    l.deliveries.retain(|x| *x != id);
                    if l.current == Some(id) {
                        l.current = None;
                    }
                }
            }
            self.remove_delivery(id);
        }
    }

    fn remove_delivery(&mut self, id: DeliveryId) {
        if let Some(d) = self.deliveries.remove(&id) {
            if let (Some(number), Some(link)) = (d.number, self.links.get(d.link.0)) {
                if let Some(s) = self.sessions.get_mut(link.session.0) {
                    match d.is_outgoing() {
                        true => s.outgoing_deliveries.remove(&number),
                        false => s.incoming_deliveries.remove(&number),
                    };
                }
            }
        }
        self.work_list.retain(|x| *x != id);
        self.tpwork.retain(|x| *x != id);
    }

    /// Whether the connection final event has been emitted
    pub fn is_final(&self) -> bool {
        self.final_emitted
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        endpoint::EndpointState,
        event::{Collector, EventType},
        transport::Transport,
    };

    use super::Connection;

    fn kinds(collector: &Collector) -> Vec<EventType> {
        std::iter::from_fn(|| collector.pop()).map(|e| e.kind()).collect()
    }

    #[test]
    fn open_and_close_emit_once() {
        let collector = Collector::new();
        let mut conn = Connection::new("test");
        conn.collect(collector.clone());
        conn.open();
        conn.open();
        conn.close(None);
        conn.close(None);
        conn.open();
        assert_eq!(
            kinds(&collector),
            vec![
                EventType::ConnectionInit,
                EventType::ConnectionLocalOpen,
                EventType::ConnectionLocalClose
            ]
        );
        assert!(conn.state().matches(EndpointState::LOCAL_CLOSED));
    }

    #[test]
    fn bind_twice_is_rejected() {
        let mut conn = Connection::new("test");
        conn.bind(Transport::new()).unwrap();
        assert!(conn.bind(Transport::new()).is_err());
        assert!(conn.unbind().is_some());
        assert!(conn.bind(Transport::new()).is_ok());
    }

    #[test]
    fn iteration_filters_by_state() {
        let mut conn = Connection::new("test");
        let a = conn.create_session();
        let b = conn.create_session();
        let c = conn.create_session();
        conn.open_session(a).unwrap();
        conn.open_session(c).unwrap();
        conn.close_session(b, None).unwrap();

        let active = EndpointState::LOCAL_ACTIVE;
        assert_eq!(conn.session_head(active), Some(a));
        assert_eq!(conn.session_next(a, active), Some(c));
        assert_eq!(conn.session_next(c, active), None);
        assert_eq!(conn.session_head(EndpointState::LOCAL_CLOSED), Some(b));
        assert_eq!(conn.session_head(EndpointState::any()), Some(a));
    }

    #[test]
    fn work_list_keeps_updated_deliveries_in_order() {
        let mut conn = Connection::new("test");
        let session = conn.create_session();
        let link = conn.create_sender(session, "sender").unwrap();
        let first = conn.next_delivery(link).unwrap();
        let second = conn.next_delivery(link).unwrap();

        conn.update(second, crate::types::accepted())
            .unwrap();
        conn.update(first, crate::types::released())
            .unwrap();
        assert_eq!(conn.work_head(), Some(second));
        assert_eq!(conn.work_next(second), Some(first));

        conn.clear(second);
        assert_eq!(conn.work_head(), Some(first));
        assert_eq!(conn.work_next(first), None);
    }

    #[test]
    fn settled_delivery_rejects_update_and_settle() {
        let mut conn = Connection::new("test");
        let session = conn.create_session();
        let link = conn.create_sender(session, "sender").unwrap();
        let delivery = conn.next_delivery(link).unwrap();
        conn.settle(delivery).unwrap();
        assert!(matches!(
            conn.settle(delivery),
            Err(crate::Error::IllegalState(_))
        ));
        assert!(matches!(
            conn.update(delivery, crate::types::accepted()),
            Err(crate::Error::IllegalState(_))
        ));
    }

    fn pump(a: &mut Connection, b: &mut Connection) {
        loop {
            let from_a = a.take_output();
            let _ = b.push(&from_a);
            let from_b = b.take_output();
            let _ = a.push(&from_b);
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
        }
    }

    #[test]
    fn reclaiming_a_detached_link_forgets_its_unsettled_deliveries() {
        let mut client = Connection::new("client");
        let mut server = Connection::builder().container_id("server").server().build();
        client.open();
        server.open();
        let session = client.create_session();
        client.open_session(session).unwrap();
        let sender = client.create_sender(session, "sender").unwrap();
        client.open_link(sender).unwrap();
        pump(&mut client, &mut server);

        let remote_session = server.session_head(EndpointState::REMOTE_ACTIVE).unwrap();
        server.open_session(remote_session).unwrap();
        let receiver = server.link_head(EndpointState::REMOTE_ACTIVE).unwrap();
        server.open_link(receiver).unwrap();
        server.flow(receiver, 2).unwrap();
        pump(&mut client, &mut server);

        for _ in 0..2 {
            client.next_delivery(sender).unwrap();
            client.send(sender, b"unsettled").unwrap();
            client.advance(sender).unwrap();
        }
        pump(&mut client, &mut server);
        assert_eq!(client.sessions[session.0].outgoing_deliveries.len(), 2);
        assert_eq!(server.sessions[remote_session.0].incoming_deliveries.len(), 2);

        client.detach_link(sender).unwrap();
        pump(&mut client, &mut server);
        server.detach_link(receiver).unwrap();
        pump(&mut client, &mut server);

        client.reclaim();
        server.reclaim();
        assert!(client.get_link(sender).is_none());
        assert!(server.get_link(receiver).is_none());
        assert!(client.sessions[session.0].outgoing_deliveries.is_empty());
        assert!(client.sessions[session.0].incoming_deliveries.is_empty());
        assert!(server.sessions[remote_session.0].outgoing_deliveries.is_empty());
        assert!(server.sessions[remote_session.0].incoming_deliveries.is_empty());
        assert!(client.deliveries.is_empty());
        assert!(server.deliveries.is_empty());
    }
}
