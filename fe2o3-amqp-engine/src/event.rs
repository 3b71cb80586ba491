//! Events and the collector that queues them

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{
    endpoint::{ConnectionId, DeliveryId, LinkId, SessionId},
    reactor::TaskId,
};

/// Kind of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The reactor has been started
    ReactorInit,
    /// The reactor has no more events to process
    ReactorQuiesced,
    /// The reactor has been stopped
    ReactorFinal,
    /// A scheduled task is due
    TimerTask,

    /// The connection has been created
    ConnectionInit,
    /// The connection has been bound to a transport
    ConnectionBound,
    /// The connection has been unbound from its transport
    ConnectionUnbound,
    /// The local connection endpoint has been opened
    ConnectionLocalOpen,
    /// The remote peer opened the connection
    ConnectionRemoteOpen,
    /// The local connection endpoint has been closed
    ConnectionLocalClose,
    /// The remote peer closed the connection
    ConnectionRemoteClose,
    /// The connection is about to be freed
    ConnectionFinal,

    /// The session has been created
    SessionInit,
    /// The local session endpoint has been opened
    SessionLocalOpen,
    /// The remote peer began the session
    SessionRemoteOpen,
    /// The local session endpoint has been closed
    SessionLocalClose,
    /// The remote peer ended the session
    SessionRemoteClose,
    /// The session is about to be freed
    SessionFinal,

    /// The link has been created
    LinkInit,
    /// The local link endpoint has been opened
    LinkLocalOpen,
    /// The remote peer attached the link
    LinkRemoteOpen,
    /// The local link endpoint has been closed
    LinkLocalClose,
    /// The remote peer detached the link with `closed=true`
    LinkRemoteClose,
    /// The local link endpoint has been detached without closing it
    LinkLocalDetach,
    /// The remote peer detached the link without closing it
    LinkRemoteDetach,
    /// The flow state of the link changed
    LinkFlow,
    /// The link is about to be freed
    LinkFinal,

    /// A delivery has been created or updated
    Delivery,

    /// The transport has new state to report (SASL progress, new output)
    Transport,
    /// The transport detected an error
    TransportError,
    /// The transport will produce no more output
    TransportHeadClosed,
    /// The transport will accept no more input
    TransportTailClosed,
    /// Both ends of the transport are closed
    TransportClosed,
}

impl EventType {
    /// Whether the event concerns a connection endpoint
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            EventType::ConnectionInit
                | EventType::ConnectionBound
                | EventType::ConnectionUnbound
                | EventType::ConnectionLocalOpen
                | EventType::ConnectionRemoteOpen
                | EventType::ConnectionLocalClose
                | EventType::ConnectionRemoteClose
                | EventType::ConnectionFinal
        )
    }
}

/// An immutable record of something that happened in the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub(crate) kind: EventType,
    pub(crate) connection: Option<ConnectionId>,
    pub(crate) session: Option<SessionId>,
    pub(crate) link: Option<LinkId>,
    pub(crate) delivery: Option<DeliveryId>,
    pub(crate) task: Option<TaskId>,
}

impl Event {
    pub(crate) fn new(kind: EventType) -> Self {
        Self {
            kind,
            connection: None,
            session: None,
            link: None,
            delivery: None,
            task: None,
        }
    }

    pub(crate) fn connection(kind: EventType, connection: ConnectionId) -> Self {
        Self {
            connection: Some(connection),
            ..Self::new(kind)
        }
    }

    pub(crate) fn session(kind: EventType, connection: ConnectionId, session: SessionId) -> Self {
        Self {
            session: Some(session),
            ..Self::connection(kind, connection)
        }
    }

    pub(crate) fn link(
        kind: EventType,
        connection: ConnectionId,
        session: SessionId,
        link: LinkId,
    ) -> Self {
        Self {
            link: Some(link),
            ..Self::session(kind, connection, session)
        }
    }

    pub(crate) fn delivery(
        connection: ConnectionId,
        session: SessionId,
        link: LinkId,
        delivery: DeliveryId,
    ) -> Self {
        Self {
            delivery: Some(delivery),
            ..Self::link(EventType::Delivery, connection, session, link)
        }
    }

    pub(crate) fn task(task: TaskId) -> Self {
        Self {
            task: Some(task),
            ..Self::new(EventType::TimerTask)
        }
    }

    /// Kind of the event
    pub fn kind(&self) -> EventType {
        self.kind
    }

    /// The connection the event concerns
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// The session the event concerns
    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    /// The link the event concerns
    pub fn link_id(&self) -> Option<LinkId> {
        self.link
    }

    /// The delivery the event concerns
    pub fn delivery_id(&self) -> Option<DeliveryId> {
        self.delivery
    }

    /// The timer task of a [`EventType::TimerTask`] event
    pub fn task_id(&self) -> Option<TaskId> {
        self.task
    }
}

/// FIFO queue of events shared between the engine and the reactor
///
/// Cloning a collector yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct Collector {
    queue: Arc<Mutex<VecDeque<Event>>>,
}

impl Collector {
    /// Creates an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    ///
    /// An event identical to the last queued one is dropped.
    pub fn put(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.back() == Some(&event) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(?event, "collect");
        #[cfg(feature = "log")]
        log::trace!("collect event={:?}", event);

        queue.push_back(event);
    }

    /// Removes and returns the oldest event
    pub fn pop(&self) -> Option<Event> {
        self.queue.lock().pop_front()
    }

    /// Returns a copy of the oldest event without removing it
    pub fn peek(&self) -> Option<Event> {
        self.queue.lock().front().cloned()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no event is queued
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drops every queued event
    pub fn release(&self) {
        self.queue.lock().clear()
    }

    /// Whether both handles refer to the same queue
    pub fn same_queue(&self, other: &Collector) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }
}

#[cfg(test)]
mod tests {
    use crate::endpoint::{ConnectionId, LinkId, SessionId};

    use super::{Collector, Event, EventType};

    #[test]
    fn events_come_out_in_production_order() {
        let collector = Collector::new();
        let conn = ConnectionId(0);
        collector.put(Event::connection(EventType::ConnectionInit, conn));
        collector.put(Event::session(EventType::SessionInit, conn, SessionId(0)));
        collector.put(Event::link(
            EventType::LinkInit,
            conn,
            SessionId(0),
            LinkId(0),
        ));

        let kinds: Vec<EventType> = std::iter::from_fn(|| collector.pop())
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventType::ConnectionInit,
                EventType::SessionInit,
                EventType::LinkInit
            ]
        );
        assert!(collector.is_empty());
    }

    #[test]
    fn consecutive_duplicates_are_dropped() {
        let collector = Collector::new();
        let event = Event::connection(EventType::Transport, ConnectionId(1));
        collector.put(event.clone());
        collector.put(event.clone());
        assert_eq!(collector.len(), 1);

        collector.put(Event::connection(EventType::ConnectionLocalOpen, ConnectionId(1)));
        collector.put(event);
        assert_eq!(collector.len(), 3);
    }

    #[test]
    fn clones_share_the_queue() {
        let collector = Collector::new();
        let other = collector.clone();
        other.put(Event::new(EventType::ReactorInit));
        assert_eq!(collector.peek().map(|e| e.kind()), Some(EventType::ReactorInit));
        assert!(collector.same_queue(&other));
    }
}
