//! Sessions and their transfer windows

use std::collections::HashMap;

use crate::{
    endpoint::{DeliveryId, EndpointState, LinkId, LocalState, SessionId},
    error::Error,
    event::{Event, EventType},
    types::{
        definitions::{DeliveryNumber, TransferNumber},
        Condition,
    },
    Connection, DEFAULT_INCOMING_WINDOW, DEFAULT_OUTGOING_CAPACITY,
};

/// A bidirectional sequential conversation between two containers
#[derive(Debug)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) state: EndpointState,
    pub(crate) condition: Option<Condition>,
    pub(crate) remote_condition: Option<Condition>,
    pub(crate) links: Vec<LinkId>,

    /// Incoming window advertised to the peer, in transfer frames
    pub(crate) incoming_window: u32,
    /// Bytes that may be buffered in outgoing deliveries before `send` accepts less
    pub(crate) outgoing_capacity: usize,
    pub(crate) outgoing_bytes: usize,
    pub(crate) incoming_bytes: usize,

    pub(crate) local_channel: Option<u16>,
    pub(crate) remote_channel: Option<u16>,
    pub(crate) begin_sent: bool,
    pub(crate) end_sent: bool,

    pub(crate) next_outgoing_id: TransferNumber,
    pub(crate) next_incoming_id: TransferNumber,
    pub(crate) remote_incoming_window: u32,
    pub(crate) remote_outgoing_window: u32,
    /// Transfer frames the peer may still send before the window is renewed
    pub(crate) incoming_credit: u32,

    pub(crate) next_delivery_number: DeliveryNumber,
    pub(crate) outgoing_deliveries: HashMap<DeliveryNumber, DeliveryId>,
    pub(crate) incoming_deliveries: HashMap<DeliveryNumber, DeliveryId>,
    pub(crate) input_handles: HashMap<u32, LinkId>,

    pub(crate) flow_pending: bool,
    pub(crate) final_emitted: bool,
}

impl Session {
    pub(crate) fn new(id: SessionId, incoming_window: u32, outgoing_capacity: usize) -> Self {
        Self {
            id,
            state: EndpointState::new(),
            condition: None,
            remote_condition: None,
            links: Vec::new(),
            incoming_window,
            outgoing_capacity,
            outgoing_bytes: 0,
            incoming_bytes: 0,
            local_channel: None,
            remote_channel: None,
            begin_sent: false,
            end_sent: false,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            incoming_credit: incoming_window,
            next_delivery_number: 0,
            outgoing_deliveries: HashMap::new(),
            incoming_deliveries: HashMap::new(),
            input_handles: HashMap::new(),
            flow_pending: false,
            final_emitted: false,
        }
    }

    /// Id of the session
    pub fn id(&self) -> SessionId {
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

    /// Error condition sent by the peer with its end
    pub fn remote_condition(&self) -> Option<&Condition> {
        self.remote_condition.as_ref()
    }

    /// Links of the session in creation order
    pub fn links(&self) -> &[LinkId] {
        &self.links
    }

    /// Incoming window in transfer frames
    pub fn incoming_window(&self) -> u32 {
        self.incoming_window
    }

    /// Bytes `send` may buffer ahead of the wire
    pub fn outgoing_capacity(&self) -> usize {
        self.outgoing_capacity
    }

    /// Outgoing bytes buffered and not yet written
    pub fn outgoing_bytes(&self) -> usize {
        self.outgoing_bytes
    }

    /// Incoming bytes received and not yet read
    pub fn incoming_bytes(&self) -> usize {
        self.incoming_bytes
    }

    /// Remaining transfer frames the peer lets this end send
    pub fn remote_incoming_window(&self) -> u32 {
        self.remote_incoming_window
    }
}

impl Connection {
    /// Creates a session
    pub fn create_session(&mut self) -> SessionId {
        let entry = self.sessions.vacant_entry();
        let id = SessionId(entry.key());
        entry.insert(Session::new(
            id,
            self.session_defaults.incoming_window,
            self.session_defaults.outgoing_capacity,
        ));
        self.emit(Event::session(EventType::SessionInit, self.id, id));
        id
    }

    /// Looks up a session
    pub fn get_session(&self, session: SessionId) -> Option<&Session> {
        self.sessions.get(session.0)
    }

    fn session_mut(&mut self, session: SessionId) -> Result<&mut Session, Error> {
        self.sessions.get_mut(session.0).ok_or(Error::NotFound)
    }

    /// Opens the local end of a session
    pub fn open_session(&mut self, session: SessionId) -> Result<(), Error> {
        if self.session_mut(session)?.state.set_local(LocalState::Active) {
            self.emit(Event::session(EventType::SessionLocalOpen, self.id, session));
        }
        Ok(())
    }

    /// Closes the local end of a session
    pub fn close_session(
        &mut self,
        session: SessionId,
        condition: Option<Condition>,
    ) -> Result<(), Error> {
        let s = self.session_mut(session)?;
        if s.condition.is_none() {
            s.condition = condition;
        }
        if s.state.set_local(LocalState::Closed) {
            self.emit(Event::session(EventType::SessionLocalClose, self.id, session));
        }
        Ok(())
    }

    /// Sets the incoming window, in transfer frames
    pub fn set_incoming_window(&mut self, session: SessionId, window: u32) -> Result<(), Error> {
        let s = self.session_mut(session)?;
        s.incoming_window = window.max(1);
        s.incoming_credit = s.incoming_window;
        s.flow_pending = s.begin_sent;
        Ok(())
    }

    /// Sets how many bytes `send` may buffer ahead of the wire
    pub fn set_outgoing_capacity(&mut self, session: SessionId, capacity: usize) -> Result<(), Error> {
        self.session_mut(session)?.outgoing_capacity = capacity;
        Ok(())
    }
}

/// Defaults applied to new sessions
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionDefaults {
    pub(crate) incoming_window: u32,
    pub(crate) outgoing_capacity: usize,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            incoming_window: DEFAULT_INCOMING_WINDOW,
            outgoing_capacity: DEFAULT_OUTGOING_CAPACITY,
        }
    }
}
