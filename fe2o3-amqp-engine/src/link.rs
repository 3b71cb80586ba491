//! Sender and receiver links and their credit based flow control

use std::collections::VecDeque;

use crate::{
    delivery::Delivery,
    endpoint::{DeliveryId, EndpointState, LinkId, LocalState, SessionId},
    error::Error,
    event::{Event, EventType},
    types::{
        definitions::{DeliveryTag, ReceiverSettleMode, Role, SenderSettleMode, SequenceNo},
        messaging::{Source, Target},
        Condition,
    },
    Connection,
};

/// A unidirectional route between a source and a target
#[derive(Debug)]
pub struct Link {
    pub(crate) id: LinkId,
    pub(crate) session: SessionId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) state: EndpointState,
    pub(crate) condition: Option<Condition>,
    pub(crate) remote_condition: Option<Condition>,

    pub(crate) source: Option<Source>,
    pub(crate) target: Option<Target>,
    pub(crate) remote_source: Option<Source>,
    pub(crate) remote_target: Option<Target>,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) remote_snd_settle_mode: SenderSettleMode,
    pub(crate) remote_rcv_settle_mode: ReceiverSettleMode,
    pub(crate) max_message_size: Option<u64>,

    pub(crate) credit: u32,
    pub(crate) delivery_count: SequenceNo,
    pub(crate) available: u32,
    pub(crate) drain: bool,
    pub(crate) drained: u32,

    pub(crate) deliveries: VecDeque<DeliveryId>,
    pub(crate) current: Option<DeliveryId>,
    pub(crate) tag_counter: u64,

    pub(crate) local_handle: Option<u32>,
    pub(crate) remote_handle: Option<u32>,
    pub(crate) attach_sent: bool,
    pub(crate) detach_sent: bool,
    pub(crate) detach_closes: bool,
    pub(crate) flow_pending: bool,
    pub(crate) final_emitted: bool,
}

impl Link {
    pub(crate) fn new(id: LinkId, session: SessionId, name: String, role: Role) -> Self {
        Self {
            id,
            session,
            name,
            role,
            state: EndpointState::new(),
            condition: None,
            remote_condition: None,
            source: None,
            target: None,
            remote_source: None,
            remote_target: None,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            remote_snd_settle_mode: SenderSettleMode::default(),
            remote_rcv_settle_mode: ReceiverSettleMode::default(),
            max_message_size: None,
            credit: 0,
            delivery_count: 0,
            available: 0,
            drain: false,
            drained: 0,
            deliveries: VecDeque::new(),
            current: None,
            tag_counter: 0,
            local_handle: None,
            remote_handle: None,
            attach_sent: false,
            detach_sent: false,
            detach_closes: true,
            flow_pending: false,
            final_emitted: false,
        }
    }

    /// Id of the link
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The session the link belongs to
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Name of the link
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role of the local end
    pub fn role(&self) -> Role {
        self.role.clone()
    }

    /// Whether the local end sends
    pub fn is_sender(&self) -> bool {
        matches!(self.role, Role::Sender)
    }

    /// Whether the local end receives
    pub fn is_receiver(&self) -> bool {
        matches!(self.role, Role::Receiver)
    }

    /// Endpoint state
    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Local error condition
    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Error condition sent by the peer with its detach
    pub fn remote_condition(&self) -> Option<&Condition> {
        self.remote_condition.as_ref()
    }

    /// Local source terminus
    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    /// Local target terminus
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Source terminus attached by the peer
    pub fn remote_source(&self) -> Option<&Source> {
        self.remote_source.as_ref()
    }

    /// Target terminus attached by the peer
    pub fn remote_target(&self) -> Option<&Target> {
        self.remote_target.as_ref()
    }

    /// Local sender settle mode
    pub fn snd_settle_mode(&self) -> SenderSettleMode {
        self.snd_settle_mode.clone()
    }

    /// Local receiver settle mode
    pub fn rcv_settle_mode(&self) -> ReceiverSettleMode {
        self.rcv_settle_mode.clone()
    }

    /// Sender settle mode attached by the peer
    pub fn remote_snd_settle_mode(&self) -> SenderSettleMode {
        self.remote_snd_settle_mode.clone()
    }

    /// Receiver settle mode attached by the peer
    pub fn remote_rcv_settle_mode(&self) -> ReceiverSettleMode {
        self.remote_rcv_settle_mode.clone()
    }

    /// Credit left. On a sender it is the number of deliveries that may still be
    /// issued, on a receiver the number of deliveries the peer may still send.
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Delivery count of the link
    pub fn delivery_count(&self) -> SequenceNo {
        self.delivery_count
    }

    /// Deliveries the sender has announced as available
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Drain flag
    pub fn get_drain(&self) -> bool {
        self.drain
    }

    /// The current delivery
    pub fn current(&self) -> Option<DeliveryId> {
        self.current
    }

    /// Deliveries known on this link, oldest first
    pub fn deliveries(&self) -> impl Iterator<Item = DeliveryId> + '_ {
        self.deliveries.iter().copied()
    }
}

impl Connection {
    /// Looks up a link
    pub fn get_link(&self, link: LinkId) -> Option<&Link> {
        self.links.get(link.0)
    }

    fn link_mut(&mut self, link: LinkId) -> Result<&mut Link, Error> {
        self.links.get_mut(link.0).ok_or(Error::NotFound)
    }

    pub(crate) fn insert_link(&mut self, session: SessionId, name: String, role: Role) -> LinkId {
        let entry = self.links.vacant_entry();
        let id = LinkId(entry.key());
        entry.insert(Link::new(id, session, name, role));
        if let Some(s) = self.sessions.get_mut(session.0) {
            s.links.push(id);
        }
        self.emit(Event::link(EventType::LinkInit, self.id, session, id));
        id
    }

    /// Creates a sending link on a session
    pub fn create_sender(&mut self, session: SessionId, name: impl Into<String>) -> Result<LinkId, Error> {
        if !self.sessions.contains(session.0) {
            return Err(Error::NotFound);
        }
        Ok(self.insert_link(session, name.into(), Role::Sender))
    }

    /// Creates a receiving link on a session
    pub fn create_receiver(&mut self, session: SessionId, name: impl Into<String>) -> Result<LinkId, Error> {
        if !self.sessions.contains(session.0) {
            return Err(Error::NotFound);
        }
        Ok(self.insert_link(session, name.into(), Role::Receiver))
    }

    fn emit_link(&self, kind: EventType, link: LinkId) {
        if let Some(l) = self.links.get(link.0) {
            self.emit(Event::link(kind, self.id, l.session, link));
        }
    }

    /// Opens the local end of a link
    pub fn open_link(&mut self, link: LinkId) -> Result<(), Error> {
        if self.link_mut(link)?.state.set_local(LocalState::Active) {
            self.emit_link(EventType::LinkLocalOpen, link);
        }
        Ok(())
    }

    /// Closes the local end of a link. The detach sent to the peer has `closed=true`.
    pub fn close_link(&mut self, link: LinkId, condition: Option<Condition>) -> Result<(), Error> {
        let l = self.link_mut(link)?;
        if l.condition.is_none() {
            l.condition = condition;
        }
        if l.state.set_local(LocalState::Closed) {
            l.detach_closes = true;
            self.emit_link(EventType::LinkLocalClose, link);
        }
        Ok(())
    }

    /// Detaches the local end of a link without closing it
    pub fn detach_link(&mut self, link: LinkId) -> Result<(), Error> {
        let l = self.link_mut(link)?;
        if l.state.set_local(LocalState::Closed) {
            l.detach_closes = false;
            self.emit_link(EventType::LinkLocalDetach, link);
        }
        Ok(())
    }

    /// Sets the local source terminus
    pub fn set_source(&mut self, link: LinkId, source: Source) -> Result<(), Error> {
        self.link_mut(link)?.source = Some(source);
        Ok(())
    }

    /// Sets the local target terminus
    pub fn set_target(&mut self, link: LinkId, target: Target) -> Result<(), Error> {
        self.link_mut(link)?.target = Some(target);
        Ok(())
    }

    /// Sets the sender settle mode
    pub fn set_snd_settle_mode(&mut self, link: LinkId, mode: SenderSettleMode) -> Result<(), Error> {
        self.link_mut(link)?.snd_settle_mode = mode;
        Ok(())
    }

    /// Sets the receiver settle mode
    pub fn set_rcv_settle_mode(&mut self, link: LinkId, mode: ReceiverSettleMode) -> Result<(), Error> {
        self.link_mut(link)?.rcv_settle_mode = mode;
        Ok(())
    }

    /// Sets the max message size announced in the attach
    pub fn set_max_message_size(&mut self, link: LinkId, size: Option<u64>) -> Result<(), Error> {
        self.link_mut(link)?.max_message_size = size;
        Ok(())
    }

    /// Deliveries buffered locally. On a sender these are not yet fully written,
    /// on a receiver they have arrived but have not been advanced past.
    pub fn queued(&self, link: LinkId) -> u32 {
        let l = match self.links.get(link.0) {
            Some(l) => l,
            None => return 0,
        };
        l.deliveries
            .iter()
            .filter_map(|id| self.deliveries.get(id))
            .filter(|d| match l.role {
                Role::Sender => !d.transfer_complete,
                Role::Receiver => !d.advanced,
            })
            .count() as u32
    }

    /// Deliveries on the link that are not settled locally
    pub fn unsettled(&self, link: LinkId) -> u32 {
        self.links
            .get(link.0)
            .map(|l| {
                l.deliveries
                    .iter()
                    .filter_map(|id| self.deliveries.get(id))
                    .filter(|d| !d.settled)
                    .count() as u32
            })
            .unwrap_or(0)
    }

    /// Whether the peer asked to drain and there is more credit than deliveries to
    /// use it
    pub fn draining(&self, link: LinkId) -> bool {
        match self.links.get(link.0) {
            Some(l) => l.drain && l.credit > self.queued(link),
            None => false,
        }
    }

    /// Grants credit to the sender
    pub fn flow(&mut self, link: LinkId, credit: u32) -> Result<(), Error> {
        let l = self.link_mut(link)?;
        if !l.is_receiver() {
            return Err(Error::IllegalState("credit is granted by the receiver"));
        }
        l.credit = l.credit.saturating_add(credit);
        l.flow_pending = true;
        Ok(())
    }

    /// Grants credit and asks the sender to use it up or give it back
    pub fn drain(&mut self, link: LinkId, credit: u32) -> Result<(), Error> {
        self.flow(link, credit)?;
        self.link_mut(link)?.drain = true;
        Ok(())
    }

    /// Sets the drain flag of a receiver
    pub fn set_drain(&mut self, link: LinkId, drain: bool) -> Result<(), Error> {
        let l = self.link_mut(link)?;
        if !l.is_receiver() {
            return Err(Error::IllegalState("drain is requested by the receiver"));
        }
        if l.drain != drain {
            l.drain = drain;
            l.flow_pending = true;
        }
        Ok(())
    }

    /// On a sender, gives back the credit left while draining and returns how much
    /// was given back. On a receiver, returns the credit the sender has drained since
    /// the last call.
    pub fn drained(&mut self, link: LinkId) -> Result<u32, Error> {
        let queued = self.queued(link);
        let l = self.link_mut(link)?;
        match l.role {
            Role::Sender => {
                if !l.drain || l.credit == 0 || queued > 0 {
                    return Ok(0);
                }
                let n = l.credit;
                l.delivery_count = l.delivery_count.wrapping_add(n);
                l.credit = 0;
                l.flow_pending = true;
                Ok(n)
            }
            Role::Receiver => Ok(std::mem::take(&mut l.drained)),
        }
    }

    /// Announces deliveries available on a sender without consuming credit
    pub fn offered(&mut self, link: LinkId, available: u32) -> Result<(), Error> {
        let l = self.link_mut(link)?;
        if !l.is_sender() {
            return Err(Error::IllegalState("only a sender offers deliveries"));
        }
        l.available = available;
        l.flow_pending = true;
        Ok(())
    }

    /// Creates an outgoing delivery. The first delivery created on a link becomes
    /// its current delivery.
    pub fn delivery(&mut self, link: LinkId, tag: impl Into<DeliveryTag>) -> Result<DeliveryId, Error> {
        let tag = tag.into();
        let l = self.links.get(link.0).ok_or(Error::NotFound)?;
        if !l.is_sender() {
            return Err(Error::IllegalState("incoming deliveries are created by the peer"));
        }
        let in_use = l
            .deliveries
            .iter()
            .filter_map(|id| self.deliveries.get(id))
            .any(|d| !d.settled && d.tag == tag);
        if in_use {
            return Err(Error::IllegalState("delivery tag is already in use"));
        }

        let id = DeliveryId(self.next_delivery_id);
        self.next_delivery_id += 1;
        self.deliveries
            .insert(id, Delivery::new(id, link, Role::Sender, tag));
        let l = self.link_mut(link)?;
        l.deliveries.push_back(id);
        if l.current.is_none() {
            l.current = Some(id);
        }
        Ok(id)
    }

    /// Creates an outgoing delivery tagged with the next value of the link's counter
    pub fn next_delivery(&mut self, link: LinkId) -> Result<DeliveryId, Error> {
        loop {
            let l = self.link_mut(link)?;
            let tag = l.tag_counter.to_string().into_bytes();
            l.tag_counter += 1;
            match self.delivery(link, tag) {
                Err(Error::IllegalState("delivery tag is already in use")) => continue,
                result => return result,
            }
        }
    }

    /// Appends bytes to the current delivery of a sender and returns how many were
    /// accepted. Fewer bytes than offered are accepted once the session's outgoing
    /// capacity is used up.
    ///
    /// The first send on a delivery issues it, which takes one unit of credit and
    /// fails with [`Error::FlowControl`] if there is none.
    pub fn send(&mut self, link: LinkId, bytes: &[u8]) -> Result<usize, Error> {
        let l = self.links.get_mut(link.0).ok_or(Error::NotFound)?;
        if !l.is_sender() {
            return Err(Error::IllegalState("only a sender sends"));
        }
        let current = l
            .current
            .ok_or(Error::IllegalState("there is no current delivery"))?;
        let d = self.deliveries.get_mut(&current).ok_or(Error::NotFound)?;
        if d.settled {
            return Err(Error::IllegalState("delivery is already settled"));
        }
        if !d.issued {
            if l.credit == 0 {
                return Err(Error::FlowControl);
            }
            l.credit -= 1;
            l.delivery_count = l.delivery_count.wrapping_add(1);
            d.issued = true;
        }

        let session = self.sessions.get_mut(l.session.0).ok_or(Error::NotFound)?;
        let remaining = session.outgoing_capacity.saturating_sub(session.outgoing_bytes);
        let n = bytes.len().min(remaining);
        d.data.extend_from_slice(&bytes[..n]);
        session.outgoing_bytes += n;
        self.add_tpwork(current);
        Ok(n)
    }

    /// Reads bytes of the current delivery of a receiver. Returns `None` once the
    /// delivery is complete and fully read.
    pub fn recv(&mut self, link: LinkId, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let l = self.links.get(link.0).ok_or(Error::NotFound)?;
        if !l.is_receiver() {
            return Err(Error::IllegalState("only a receiver receives"));
        }
        let session = l.session;
        let current = l
            .current
            .ok_or(Error::IllegalState("there is no current delivery"))?;
        let d = self.deliveries.get_mut(&current).ok_or(Error::NotFound)?;
        if d.data.is_empty() {
            return match d.partial {
                true => Ok(Some(0)),
                false => Ok(None),
            };
        }
        let n = buf.len().min(d.data.len());
        let chunk = d.data.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        if let Some(s) = self.sessions.get_mut(session.0) {
            s.incoming_bytes = s.incoming_bytes.saturating_sub(n);
        }
        Ok(Some(n))
    }

    /// Retires the current delivery and makes the next one current. Returns whether
    /// the current delivery changed.
    pub fn advance(&mut self, link: LinkId) -> Result<bool, Error> {
        let l = self.links.get(link.0).ok_or(Error::NotFound)?;
        let current = match l.current {
            Some(current) => current,
            None => return Ok(false),
        };
        let is_sender = l.is_sender();
        if let Some(d) = self.deliveries.get_mut(&current) {
            d.advanced = true;
        }
        let next = l
            .deliveries
            .iter()
            .copied()
            .skip_while(|id| *id != current)
            .skip(1)
            .find(|id| self.deliveries.get(id).map(|d| !d.advanced).unwrap_or(false));
        if is_sender {
            self.add_tpwork(current);
        }
        self.link_mut(link)?.current = next;
        Ok(true)
    }

    /// Issues queued deliveries that were advanced before credit arrived
    pub(crate) fn issue_queued(&mut self, link: LinkId) {
        let l = match self.links.get_mut(link.0) {
            Some(l) => l,
            None => return,
        };
        let mut issued = Vec::new();
        for id in l.deliveries.iter() {
            if l.credit == 0 {
                break;
            }
            if let Some(d) = self.deliveries.get_mut(id) {
                if !d.issued && d.advanced {
                    d.issued = true;
                    l.credit -= 1;
                    l.delivery_count = l.delivery_count.wrapping_add(1);
                    issued.push(*id);
                }
            }
        }
        for id in issued {
            self.add_tpwork(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{error::Error, Connection};

    fn sender() -> (Connection, crate::LinkId) {
        let mut conn = Connection::new("test");
        let session = conn.create_session();
        let link = conn.create_sender(session, "sender").unwrap();
        (conn, link)
    }

    #[test]
    fn send_without_credit_is_a_flow_control_error() {
        let (mut conn, link) = sender();
        conn.next_delivery(link).unwrap();
        assert!(matches!(conn.send(link, b"x"), Err(Error::FlowControl)));
        conn.links[link.0].credit = 1;
        assert_eq!(conn.send(link, b"x").unwrap(), 1);
        assert_eq!(conn.get_link(link).unwrap().credit(), 0);
        // Already issued, no more credit needed
        assert_eq!(conn.send(link, b"yz").unwrap(), 2);
    }

    #[test]
    fn counter_tags_are_unique() {
        let (mut conn, link) = sender();
        let first = conn.next_delivery(link).unwrap();
        let second = conn.next_delivery(link).unwrap();
        assert_eq!(conn.get_delivery(first).unwrap().tag(), b"0");
        assert_eq!(conn.get_delivery(second).unwrap().tag(), b"1");
        assert!(conn.delivery(link, b"1".to_vec()).is_err());
        assert_eq!(conn.get_link(link).unwrap().current(), Some(first));
    }

    #[test]
    fn advance_exposes_the_next_delivery() {
        let (mut conn, link) = sender();
        let first = conn.next_delivery(link).unwrap();
        let second = conn.next_delivery(link).unwrap();
        assert!(conn.advance(link).unwrap());
        assert_eq!(conn.get_link(link).unwrap().current(), Some(second));
        assert!(conn.get_delivery(first).unwrap().is_buffered());
        assert_eq!(conn.queued(link), 2);
    }

    #[test]
    fn only_receivers_grant_credit() {
        let (mut conn, link) = sender();
        assert!(conn.flow(link, 10).is_err());
        let session = conn.get_link(link).unwrap().session();
        let receiver = conn.create_receiver(session, "receiver").unwrap();
        conn.flow(receiver, 10).unwrap();
        conn.flow(receiver, u32::MAX).unwrap();
        assert_eq!(conn.get_link(receiver).unwrap().credit(), u32::MAX);
    }
}
