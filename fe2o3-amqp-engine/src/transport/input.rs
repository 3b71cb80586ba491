//! Processing of the bytes pushed into the tail of a transport

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::{
    delivery::Delivery,
    endpoint::{DeliveryId, RemoteState, SessionId},
    event::{Event, EventType},
    frames::amqp::FrameBody,
    types::{
        condition,
        definitions::{
            AmqpError, ConnectionError, DeliveryNumber, LinkError, Role, SessionError,
        },
        messaging::Target,
        performatives::{Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Transfer},
        sasl::SaslCode,
        Condition,
    },
    Connection, MIN_MAX_FRAME_SIZE,
};

use super::{
    protocol_header::{ProtocolHeader, PROTOCOL_HEADER_SIZE},
    sasl::SaslRole,
    Error, InputState,
};

type InputResult = Result<(), Condition>;

fn unknown_channel(channel: u16) -> Condition {
    condition(
        ConnectionError::FramingError,
        format!("no session is mapped to channel {}", channel),
    )
}

fn unattached_handle(handle: u32) -> Condition {
    condition(
        SessionError::UnattachedHandle,
        format!("no link is attached to handle {}", handle),
    )
}

/// The local role of a link the peer attached with `role`
fn local_role(role: &Role) -> Role {
    match role {
        Role::Sender => Role::Receiver,
        Role::Receiver => Role::Sender,
    }
}

impl Connection {
    /// Pushes bytes read from the peer into the tail of the transport and processes
    /// every complete frame. Protocol violations close the connection and are
    /// reported through the transport condition and a
    /// [`EventType::TransportError`] event rather than returned.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(len = bytes.len())))]
    pub fn push(&mut self, bytes: &[u8]) -> Result<usize, Error> {
        let transport = self.transport_mut();
        if transport.tail_closed {
            return Err(Error::Closed);
        }
        transport.input.extend_from_slice(bytes);
        transport.bytes_input += bytes.len() as u64;

        self.process_input();
        self.process_output();
        Ok(bytes.len())
    }

    /// Bytes the tail can take right now, `None` once it is closed
    pub fn capacity(&mut self) -> Option<usize> {
        self.transport_mut().capacity()
    }

    /// Tells the transport the peer will send nothing more. Unless the peer closed
    /// the connection first this is recorded as an aborted connection.
    pub fn close_tail(&mut self) {
        let transport = self.transport_mut();
        if transport.tail_closed {
            return;
        }
        let aborted = !transport.close_received;
        if aborted && transport.condition.is_none() {
            transport.condition = Some(condition(
                ConnectionError::FramingError,
                "connection aborted",
            ));
        }

        if aborted {
            #[cfg(feature = "tracing")]
            tracing::warn!(id = ?self.id, "connection aborted");
            #[cfg(feature = "log")]
            log::warn!("connection aborted id={:?}", self.id);

            self.emit(Event::connection(EventType::TransportError, self.id));
            self.mark_tail_closed();
            self.close_head();
        } else {
            self.mark_tail_closed();
        }
    }

    pub(crate) fn mark_tail_closed(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if transport.tail_closed {
                return;
            }
            transport.tail_closed = true;
            transport.input_state = InputState::Done;
            transport.input.clear();
            self.emit(Event::connection(EventType::TransportTailClosed, self.id));
            self.check_transport_closed();
        }
    }

    pub(crate) fn check_transport_closed(&mut self) {
        let closed = match self.transport.as_mut() {
            Some(t) if t.head_closed && t.tail_closed && !t.closed_emitted => {
                t.closed_emitted = true;
                true
            }
            _ => false,
        };
        if closed {
            self.emit(Event::connection(EventType::TransportClosed, self.id));
            self.check_finals();
        }
    }

    /// Closes the connection because the peer broke the protocol
    pub(crate) fn protocol_error(&mut self, condition: Condition) {
        #[cfg(feature = "tracing")]
        tracing::error!(id = ?self.id, ?condition, "protocol error");
        #[cfg(feature = "log")]
        log::error!("protocol error id={:?} condition={:?}", self.id, condition);

        self.close(Some(condition.clone()));
        let transport = self.transport_mut();
        if transport.condition.is_none() {
            transport.condition = Some(condition);
        }
        if !transport.open_sent {
            transport.head_closing = true;
        }
        self.emit(Event::connection(EventType::TransportError, self.id));
        self.mark_tail_closed();
    }

    pub(crate) fn process_input(&mut self) {
        loop {
            let transport = match self.transport.as_mut() {
                Some(transport) => transport,
                None => return,
            };
            let result = match transport.input_state {
                InputState::Header => {
                    if transport.input.len() < PROTOCOL_HEADER_SIZE {
                        return;
                    }
                    let mut raw = [0u8; PROTOCOL_HEADER_SIZE];
                    raw.copy_from_slice(&transport.input[..PROTOCOL_HEADER_SIZE]);
                    transport.input.advance(PROTOCOL_HEADER_SIZE);
                    self.on_incoming_header(raw)
                }
                InputState::Sasl | InputState::Amqp => {
                    let is_sasl = transport.input_state == InputState::Sasl;
                    match transport.length_codec.decode(&mut transport.input) {
                        Ok(Some(frame)) if is_sasl => self.on_incoming_sasl_frame(frame),
                        Ok(Some(frame)) => self.on_incoming_amqp_frame(frame),
                        Ok(None) => return,
                        Err(err) => Err(Error::FrameLength(err).condition()),
                    }
                }
                InputState::Done => return,
            };
            if let Err(condition) = result {
                self.protocol_error(condition);
                return;
            }
        }
    }

    fn on_incoming_header(&mut self, raw: [u8; 8]) -> InputResult {
        let header = match ProtocolHeader::try_from(raw) {
            Ok(header) if header.is_supported_version() => header,
            _ => return Err(Error::ProtocolHeaderMismatch(raw).condition()),
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(?header, "recv");
        #[cfg(feature = "log")]
        log::trace!("recv header={:?}", header);

        let transport = self.transport_mut();
        let is_server = transport.is_server;
        if header.is_sasl() {
            let sasl = match transport.sasl.as_mut() {
                Some(sasl) => sasl,
                None => {
                    return Err(condition(
                        ConnectionError::FramingError,
                        "SASL is not enabled",
                    ))
                }
            };
            if sasl.resolve_role(is_server) == SaslRole::Server {
                sasl.on_header();
                if !transport.sasl_header_sent {
                    ProtocolHeader::sasl().encode(&mut transport.output);
                    transport.sasl_header_sent = true;
                }
            }
            transport.input_state = InputState::Sasl;
            self.emit(Event::connection(EventType::Transport, self.id));
            Ok(())
        } else if header.is_amqp() {
            if let Some(sasl) = transport.sasl.as_mut() {
                if !sasl.is_finished() && sasl.on_skip().is_err() {
                    return Err(condition(
                        AmqpError::UnauthorizedAccess,
                        "SASL authentication required",
                    ));
                }
            }
            transport.amqp_header_received = true;
            if is_server && !transport.amqp_header_sent {
                ProtocolHeader::amqp().encode(&mut transport.output);
                transport.amqp_header_sent = true;
            }
            transport.input_state = InputState::Amqp;
            Ok(())
        } else {
            Err(Error::ProtocolHeaderMismatch(raw).condition())
        }
    }

    fn on_incoming_sasl_frame(&mut self, mut src: BytesMut) -> InputResult {
        let transport = self.transport_mut();
        let frame = match transport.sasl_codec.decode(&mut src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => return Err(Error::Frame(err).condition()),
        };
        let sasl = match transport.sasl.as_mut() {
            Some(sasl) => sasl,
            None => {
                return Err(condition(
                    ConnectionError::FramingError,
                    "SASL is not enabled",
                ))
            }
        };
        if let Err(err) = sasl.on_frame(frame) {
            return Err(condition(ConnectionError::FramingError, err.to_string()));
        }

        if let Some(outcome) = sasl.outcome() {
            if !outcome.is_success() {
                let code = outcome.code().unwrap_or(SaslCode::Auth);
                return Err(Error::Sasl(code).condition());
            }
            transport.input_state = InputState::Header;
        }
        self.emit(Event::connection(EventType::Transport, self.id));
        Ok(())
    }

    fn on_incoming_amqp_frame(&mut self, mut src: BytesMut) -> InputResult {
        let transport = self.transport_mut();
        let frame = match transport.decoder.decode(&mut src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => return Err(Error::Frame(err).condition()),
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(channel = frame.channel, body = ?frame.body, "recv");
        #[cfg(feature = "log")]
        log::trace!("recv channel={}, body={:?}", frame.channel, frame.body);

        let channel = frame.channel;
        match frame.body {
            FrameBody::Open(open) => self.on_incoming_open(open),
            FrameBody::Begin(begin) => self.on_incoming_begin(channel, begin),
            FrameBody::Attach(attach) => self.on_incoming_attach(channel, attach),
            FrameBody::Flow(flow) => self.on_incoming_flow(channel, flow),
            FrameBody::Transfer {
                performative,
                payload,
            } => self.on_incoming_transfer(channel, performative, payload),
            FrameBody::Disposition(disposition) => {
                self.on_incoming_disposition(channel, disposition)
            }
            FrameBody::Detach(detach) => self.on_incoming_detach(channel, detach),
            FrameBody::End(end) => self.on_incoming_end(channel, end),
            FrameBody::Close(close) => self.on_incoming_close(close),
            FrameBody::Empty => Ok(()),
        }
    }

    fn session_by_remote_channel(&self, channel: u16) -> Result<SessionId, Condition> {
        self.sessions
            .iter()
            .find(|(_, s)| s.remote_channel == Some(channel))
            .map(|(key, _)| SessionId(key))
            .ok_or_else(|| unknown_channel(channel))
    }

    fn on_incoming_open(&mut self, open: Open) -> InputResult {
        let transport = self.transport_mut();
        transport.remote_max_frame_size = open.max_frame_size.0.max(MIN_MAX_FRAME_SIZE);
        transport
            .encoder
            .set_max_frame_size(transport.remote_max_frame_size as usize);
        transport.remote_channel_max = open.channel_max.0;
        transport.remote_idle_timeout = open
            .idle_time_out
            .filter(|ms| *ms > 0)
            .map(|ms| std::time::Duration::from_millis(ms as u64));

        self.remote_open = Some(open);
        if self.state.set_remote(RemoteState::Active) {
            self.emit(Event::connection(EventType::ConnectionRemoteOpen, self.id));
        }
        Ok(())
    }

    fn on_incoming_begin(&mut self, channel: u16, begin: Begin) -> InputResult {
        if self.session_by_remote_channel(channel).is_ok() {
            return Err(condition(
                AmqpError::NotAllowed,
                format!("channel {} is already in use", channel),
            ));
        }

        let session = match begin.remote_channel {
            Some(local) => self
                .sessions
                .iter()
                .find(|(_, s)| s.local_channel == Some(local) && s.remote_channel.is_none())
                .map(|(key, _)| SessionId(key))
                .ok_or_else(|| {
                    condition(
                        AmqpError::NotFound,
                        format!("no session has begun on channel {}", local),
                    )
                })?,
            None => self.create_session(),
        };

        let s = &mut self.sessions[session.0];
        s.remote_channel = Some(channel);
        s.next_incoming_id = begin.next_outgoing_id;
        s.remote_incoming_window = begin.incoming_window;
        s.remote_outgoing_window = begin.outgoing_window;
        if s.state.set_remote(RemoteState::Active) {
            self.emit(Event::session(EventType::SessionRemoteOpen, self.id, session));
        }
        Ok(())
    }

    fn on_incoming_attach(&mut self, channel: u16, attach: Attach) -> InputResult {
        let session = self.session_by_remote_channel(channel)?;
        let handle = attach.handle.0;
        if self.sessions[session.0].input_handles.contains_key(&handle) {
            return Err(condition(
                SessionError::HandleInUse,
                format!("handle {} is already in use", handle),
            ));
        }

        let role = local_role(&attach.role);
        let is_receiver = matches!(role, Role::Receiver);
        let existing = self.sessions[session.0].links.iter().copied().find(|id| {
            self.links
                .get(id.0)
                .map(|l| {
                    l.name == attach.name
                        && l.is_receiver() == is_receiver
                        && l.remote_handle.is_none()
                })
                .unwrap_or(false)
        });
        let link = match existing {
            Some(link) => link,
            None => self.insert_link(session, attach.name.clone(), role),
        };

        let l = &mut self.links[link.0];
        l.remote_handle = Some(handle);
        l.remote_source = attach.source.map(|source| *source);
        l.remote_target = attach
            .target
            .and_then(|target| Target::try_from(*target).ok());
        l.remote_snd_settle_mode = attach.snd_settle_mode;
        l.remote_rcv_settle_mode = attach.rcv_settle_mode;
        if is_receiver {
            l.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        }
        let opened = l.state.set_remote(RemoteState::Active);
        self.sessions[session.0].input_handles.insert(handle, link);

        if opened {
            self.emit(Event::link(
                EventType::LinkRemoteOpen,
                self.id,
                session,
                link,
            ));
        }
        Ok(())
    }

    fn on_incoming_flow(&mut self, channel: u16, flow: Flow) -> InputResult {
        let session = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[session.0];
        // The peer has not seen our begin yet if next-incoming-id is absent
        let next_incoming_id = flow.next_incoming_id.unwrap_or(0);
        s.remote_incoming_window = next_incoming_id
            .wrapping_add(flow.incoming_window)
            .wrapping_sub(s.next_outgoing_id);
        s.remote_outgoing_window = flow.outgoing_window;

        let handle = match flow.handle {
            Some(handle) => handle.0,
            None => {
                if flow.echo {
                    s.flow_pending = true;
                }
                return Ok(());
            }
        };
        let link = *s
            .input_handles
            .get(&handle)
            .ok_or_else(|| unattached_handle(handle))?;

        let l = &mut self.links[link.0];
        match l.role {
            Role::Sender => {
                let limit = flow
                    .delivery_count
                    .unwrap_or(0)
                    .wrapping_add(flow.link_credit.unwrap_or(0));
                let credit = limit.wrapping_sub(l.delivery_count);
                // A negative serial difference means the credit is used up
                l.credit = match (credit as i32) < 0 {
                    true => 0,
                    false => credit,
                };
                l.drain = flow.drain;
            }
            Role::Receiver => {
                if let Some(delivery_count) = flow.delivery_count {
                    let advanced = delivery_count.wrapping_sub(l.delivery_count);
                    if advanced > 0 && (advanced as i32) > 0 {
                        l.credit = l.credit.saturating_sub(advanced);
                        l.drained = l.drained.saturating_add(advanced);
                        l.delivery_count = delivery_count;
                    }
                }
                l.available = flow.available.unwrap_or(0);
            }
        }
        if flow.echo {
            l.flow_pending = true;
        }

        self.issue_queued(link);
        self.emit(Event::link(EventType::LinkFlow, self.id, session, link));
        Ok(())
    }

    fn on_incoming_transfer(
        &mut self,
        channel: u16,
        transfer: Transfer,
        payload: Bytes,
    ) -> InputResult {
        let session = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[session.0];
        s.next_incoming_id = s.next_incoming_id.wrapping_add(1);
        s.incoming_credit = s.incoming_credit.saturating_sub(1);
        if s.incoming_credit <= s.incoming_window / 2 {
            s.incoming_credit = s.incoming_window;
            s.flow_pending = true;
        }
        let handle = transfer.handle.0;
        let link = *s
            .input_handles
            .get(&handle)
            .ok_or_else(|| unattached_handle(handle))?;
        s.incoming_bytes += payload.len();

        let l = &mut self.links[link.0];
        if !l.is_receiver() {
            return Err(condition(
                AmqpError::NotAllowed,
                "transfer received on a sending link",
            ));
        }

        let continuing = l
            .deliveries
            .back()
            .and_then(|id| self.deliveries.get(id))
            .filter(|d| d.partial)
            .map(|d| d.id);
        let delivery = match continuing {
            Some(delivery) => delivery,
            None => {
                if l.credit == 0 {
                    return Err(condition(
                        LinkError::TransferLimitExceeded,
                        "transfer received without credit",
                    ));
                }
                let number: DeliveryNumber = transfer.delivery_id.ok_or_else(|| {
                    condition(
                        AmqpError::InvalidField,
                        "first transfer of a delivery carries no delivery-id",
                    )
                })?;
                l.credit -= 1;
                l.delivery_count = l.delivery_count.wrapping_add(1);

                let id = DeliveryId(self.next_delivery_id);
                self.next_delivery_id += 1;
                let tag = transfer.delivery_tag.clone().unwrap_or_default();
                let mut d = Delivery::new(id, link, Role::Receiver, tag);
                d.number = Some(number);
                self.deliveries.insert(id, d);
                l.deliveries.push_back(id);
                if l.current.is_none() {
                    l.current = Some(id);
                }
                self.sessions[session.0]
                    .incoming_deliveries
                    .insert(number, id);
                id
            }
        };

        if let Some(d) = self.deliveries.get_mut(&delivery) {
            d.data.extend_from_slice(&payload);
            d.partial = transfer.more && !transfer.aborted;
            if transfer.aborted {
                d.aborted = true;
                d.data.clear();
            }
            if transfer.settled == Some(true) {
                d.remote_settled = true;
            }
            if let Some(state) = transfer.state {
                d.remote = Some(state);
            }
        }
        self.mark_updated(delivery);
        self.emit_delivery(delivery);
        Ok(())
    }

    fn on_incoming_disposition(&mut self, channel: u16, disposition: Disposition) -> InputResult {
        let session = self.session_by_remote_channel(channel)?;
        let s = &self.sessions[session.0];
        let first = disposition.first;
        let span = disposition.last.unwrap_or(first).wrapping_sub(first);
        // The role is the peer's, a receiver reports on what this end sent
        let known = match disposition.role {
            Role::Receiver => &s.outgoing_deliveries,
            Role::Sender => &s.incoming_deliveries,
        };
        let mut targets: Vec<(u32, DeliveryId)> = known
            .iter()
            .map(|(number, id)| (number.wrapping_sub(first), *id))
            .filter(|(offset, _)| *offset <= span)
            .collect();
        targets.sort_by_key(|(offset, _)| *offset);

        for (_, id) in targets {
            if let Some(d) = self.deliveries.get_mut(&id) {
                if let Some(state) = &disposition.state {
                    d.remote = Some(state.clone());
                }
                if disposition.settled {
                    d.remote_settled = true;
                }
            }
            self.mark_updated(id);
            self.emit_delivery(id);
        }
        Ok(())
    }

    fn on_incoming_detach(&mut self, channel: u16, detach: Detach) -> InputResult {
        let session = self.session_by_remote_channel(channel)?;
        let handle = detach.handle.0;
        let link = self.sessions[session.0]
            .input_handles
            .remove(&handle)
            .ok_or_else(|| unattached_handle(handle))?;

        let l = &mut self.links[link.0];
        l.remote_condition = detach.error;
        if l.state.set_remote(RemoteState::Closed) {
            let kind = match detach.closed {
                true => EventType::LinkRemoteClose,
                false => EventType::LinkRemoteDetach,
            };
            self.emit(Event::link(kind, self.id, session, link));
        }
        Ok(())
    }

    fn on_incoming_end(&mut self, channel: u16, end: End) -> InputResult {
        let session = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[session.0];
        s.remote_condition = end.error;
        s.remote_channel = None;
        s.input_handles.clear();
        if s.state.set_remote(RemoteState::Closed) {
            self.emit(Event::session(EventType::SessionRemoteClose, self.id, session));
        }
        Ok(())
    }

    fn on_incoming_close(&mut self, close: Close) -> InputResult {
        self.remote_condition = close.error;
        self.transport_mut().close_received = true;
        if self.state.set_remote(RemoteState::Closed) {
            self.emit(Event::connection(EventType::ConnectionRemoteClose, self.id));
        }
        self.mark_tail_closed();
        Ok(())
    }
}
