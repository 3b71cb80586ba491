//! Generation of the bytes drained from the head of a transport

use std::time::Instant;

use bytes::{Buf, Bytes};
use serde_amqp::primitives::Array;
use tokio_util::codec::Encoder;

use crate::{
    endpoint::{DeliveryId, LinkId, LocalState, RemoteState, SessionId},
    event::{Event, EventType},
    frames::amqp::{Frame, FrameBody},
    types::{
        condition,
        definitions::{AmqpError, ConnectionError, Handle, Role, SenderSettleMode},
        messaging::TargetArchetype,
        performatives::{
            Attach, Begin, ChannelMax, Close, Detach, Disposition, End, Flow, MaxFrameSize, Open,
            Transfer,
        },
    },
    Connection,
};

use super::{protocol_header::ProtocolHeader, Error};

impl Connection {
    /// Number of bytes ready to be written to the peer
    pub fn pending(&mut self) -> usize {
        self.process_output();
        self.transport.as_ref().map(|t| t.output.len()).unwrap_or(0)
    }

    /// Bytes ready to be written to the peer, without consuming them
    pub fn peek_output(&mut self) -> &[u8] {
        self.process_output();
        &self.transport_mut().output
    }

    /// Consumes `n` bytes from the head after they were written
    pub fn pop(&mut self, n: usize) {
        let transport = self.transport_mut();
        let n = n.min(transport.output.len());
        transport.output.advance(n);
        transport.bytes_output += n as u64;
        self.process_output();
    }

    /// Takes every byte ready to be written
    pub fn take_output(&mut self) -> Bytes {
        self.process_output();
        let transport = self.transport_mut();
        let output = transport.output.split().freeze();
        transport.bytes_output += output.len() as u64;
        self.maybe_close_head();
        output
    }

    /// Tells the transport nothing more will be written to the peer. Pending bytes
    /// are discarded.
    pub fn close_head(&mut self) {
        let transport = self.transport_mut();
        if transport.head_closed {
            return;
        }
        transport.head_closed = true;
        transport.output.clear();
        self.emit(Event::connection(EventType::TransportHeadClosed, self.id));
        self.check_transport_closed();
    }

    /// Checks the idle timeouts. Expiry of the local one closes the connection,
    /// the remote one is kept alive with empty frames. Returns when the transport
    /// wants to be ticked next.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        let transport = self.transport_mut();
        if transport.head_closed && transport.tail_closed {
            return None;
        }

        if transport.last_input.is_none() || transport.bytes_input != transport.ticked_input {
            transport.last_input = Some(now);
            transport.ticked_input = transport.bytes_input;
        }
        if transport.last_output.is_none() || transport.bytes_output != transport.ticked_output {
            transport.last_output = Some(now);
            transport.ticked_output = transport.bytes_output;
        }

        let mut deadline: Option<Instant> = None;
        let mut expired = false;
        if let (Some(idle), Some(last), false) = (
            transport.idle_timeout,
            transport.last_input,
            transport.tail_closed,
        ) {
            let expiry = last + idle;
            match now >= expiry {
                true => expired = true,
                false => deadline = Some(expiry),
            }
        }

        let mut heartbeat = false;
        if let (Some(remote), Some(last)) = (transport.remote_idle_timeout, transport.last_output)
        {
            if transport.can_send_amqp() && transport.open_sent && !transport.close_sent {
                let period = remote / 2;
                let mut due = last + period;
                if now >= due {
                    heartbeat = transport.output.is_empty();
                    transport.last_output = Some(now);
                    due = now + period;
                }
                deadline = Some(deadline.map_or(due, |d| d.min(due)));
            }
        }

        if heartbeat {
            #[cfg(feature = "tracing")]
            tracing::trace!("send heartbeat");
            #[cfg(feature = "log")]
            log::trace!("send heartbeat");

            if self.write_frame(0, FrameBody::Empty).is_err() {
                return None;
            }
        }

        if expired {
            let condition = condition(AmqpError::ResourceLimitExceeded, "local-idle-timeout expired");

            #[cfg(feature = "tracing")]
            tracing::error!(id = ?self.id, "local idle timeout expired");
            #[cfg(feature = "log")]
            log::error!("local idle timeout expired id={:?}", self.id);

            let transport = self.transport_mut();
            if transport.condition.is_none() {
                transport.condition = Some(condition.clone());
            }
            self.close(Some(condition));
            self.emit(Event::connection(EventType::TransportError, self.id));
            self.mark_tail_closed();
            self.process_output();
        }
        deadline
    }

    fn maybe_close_head(&mut self) {
        let close = match self.transport.as_ref() {
            Some(t) => !t.head_closed && (t.close_sent || t.head_closing) && t.output.is_empty(),
            None => false,
        };
        if close {
            self.close_head();
        }
    }

    /// Turns local endpoint changes and queued deliveries into frames
    pub(crate) fn process_output(&mut self) {
        let transport = self.transport_mut();
        if transport.head_closed {
            return;
        }

        if !transport.is_server && !transport.head_closing {
            if let Some(sasl) = transport.sasl.as_mut() {
                sasl.resolve_role(false);
                if !transport.sasl_header_sent {
                    ProtocolHeader::sasl().encode(&mut transport.output);
                    transport.sasl_header_sent = true;
                }
            }
            let sasl_passed = transport
                .sasl
                .as_ref()
                .map(|s| s.outcome().map(|o| o.is_success()).unwrap_or(false))
                .unwrap_or(true);
            if sasl_passed && !transport.amqp_header_sent {
                ProtocolHeader::amqp().encode(&mut transport.output);
                transport.amqp_header_sent = true;
            }
        }

        if let Some(sasl) = transport.sasl.as_mut() {
            while let Some(frame) = sasl.next_frame() {
                #[cfg(feature = "tracing")]
                tracing::trace!(?frame, "send");
                #[cfg(feature = "log")]
                log::trace!("send frame={:?}", frame);

                if let Err(err) = transport.sasl_codec.encode(frame, &mut transport.output) {
                    self.output_failed(&Error::Frame(err));
                    return;
                }
            }
        }

        if transport.can_send_amqp() {
            self.write_amqp_frames();
        }
        self.maybe_close_head();
        self.check_finals();
    }

    /// Closes the connection after an outgoing frame could not be encoded. The
    /// output may end in a partial frame, so the head is closed right away.
    fn output_failed(&mut self, err: &Error) {
        #[cfg(feature = "tracing")]
        tracing::error!(id = ?self.id, ?err, "failed to encode frame");
        #[cfg(feature = "log")]
        log::error!("failed to encode frame id={:?} err={:?}", self.id, err);

        let condition = condition(ConnectionError::FramingError, err.to_string());
        let transport = self.transport_mut();
        if transport.condition.is_none() {
            transport.condition = Some(condition.clone());
        }
        self.close(Some(condition));
        self.emit(Event::connection(EventType::TransportError, self.id));
        self.mark_tail_closed();
        self.close_head();
    }

    /// Encodes one frame and returns the number of frames written
    fn write_frame(&mut self, channel: u16, body: FrameBody) -> Result<u32, Error> {
        let transport = match self.transport.as_mut() {
            Some(transport) if !transport.head_closed => transport,
            _ => return Err(Error::Closed),
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(channel, ?body, "send");
        #[cfg(feature = "log")]
        log::trace!("send channel={}, body={:?}", channel, body);

        let result = transport
            .encoder
            .encode_frame(Frame::new(channel, body), &mut transport.output)
            .map_err(Error::Frame);
        if let Err(err) = &result {
            self.output_failed(err);
        }
        result
    }

    /// Encodes a transfer in at most `max_frames` frames. Returns the number of
    /// frames written and the payload left over.
    fn write_transfer(
        &mut self,
        channel: u16,
        transfer: Transfer,
        payload: Bytes,
        max_frames: u32,
    ) -> Result<(u32, Bytes), Error> {
        let transport = match self.transport.as_mut() {
            Some(transport) if !transport.head_closed => transport,
            _ => return Err(Error::Closed),
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(channel, ?transfer, len = payload.len(), "send");
        #[cfg(feature = "log")]
        log::trace!(
            "send channel={}, transfer={:?}, len={}",
            channel,
            transfer,
            payload.len()
        );

        let result = transport
            .encoder
            .encode_transfer(&mut transport.output, channel, transfer, payload, max_frames)
            .map_err(Error::Frame);
        if let Err(err) = &result {
            self.output_failed(err);
        }
        result
    }

    fn write_amqp_frames(&mut self) {
        if !self.write_open() {
            return;
        }

        let sessions: Vec<SessionId> = self.sessions.iter().map(|(key, _)| SessionId(key)).collect();
        for &session in &sessions {
            self.write_begin(session);
            let links = match self.sessions.get(session.0) {
                Some(s) if s.begin_sent && !s.end_sent => s.links.clone(),
                _ => continue,
            };
            for &link in &links {
                self.write_attach(session, link);
            }
            self.write_session_flow(session);
            for &link in &links {
                self.write_link_flow(session, link);
                if self.links.get(link.0).map(|l| l.attach_sent).unwrap_or(false) {
                    self.issue_queued(link);
                }
            }
        }

        self.write_deliveries();

        for &session in &sessions {
            let links = match self.sessions.get(session.0) {
                Some(s) if s.begin_sent && !s.end_sent => s.links.clone(),
                _ => continue,
            };
            for link in links {
                self.write_detach(session, link);
            }
            self.write_end(session);
        }
        self.write_close();
    }

    /// Returns whether the open has been sent
    fn write_open(&mut self) -> bool {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return false,
        };
        if transport.open_sent {
            return true;
        }
        if self.state.local() == LocalState::Uninit {
            return false;
        }
        transport.open_sent = true;
        let open = Open {
            container_id: self.container_id.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: MaxFrameSize(transport.max_frame_size),
            channel_max: ChannelMax(transport.channel_max),
            idle_time_out: transport.idle_timeout.map(|d| d.as_millis() as u32),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: self.offered_capabilities.clone().map(Array::from),
            desired_capabilities: self.desired_capabilities.clone().map(Array::from),
            properties: self.properties.clone(),
        };
        self.write_frame(0, FrameBody::Open(open)).is_ok()
    }

    fn allocate_channel(&self) -> Option<u16> {
        let transport = self.transport.as_ref()?;
        let max = transport.channel_max.min(transport.remote_channel_max);
        let in_use: Vec<u16> = self
            .sessions
            .iter()
            .filter(|(_, s)| !(s.end_sent && s.state.remote() == RemoteState::Closed))
            .filter_map(|(_, s)| s.local_channel)
            .collect();
        (0..=max).find(|channel| !in_use.contains(channel))
    }

    fn write_begin(&mut self, session: SessionId) {
        let s = match self.sessions.get(session.0) {
            Some(s) => s,
            None => return,
        };
        if s.begin_sent || s.state.local() == LocalState::Uninit {
            return;
        }
        // Nothing to tell a peer that never heard of the session
        if s.state.local() == LocalState::Closed && s.state.remote() == RemoteState::Uninit {
            return;
        }
        let channel = match self.allocate_channel() {
            Some(channel) => channel,
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?session, "no channel available");
                #[cfg(feature = "log")]
                log::warn!("no channel available session={:?}", session);
                return;
            }
        };

        let s = &mut self.sessions[session.0];
        s.local_channel = Some(channel);
        s.begin_sent = true;
        s.incoming_credit = s.incoming_window;
        let begin = Begin {
            remote_channel: s.remote_channel,
            next_outgoing_id: s.next_outgoing_id,
            incoming_window: s.incoming_window,
            outgoing_window: u32::MAX,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let _ = self.write_frame(channel, FrameBody::Begin(begin));
    }

    fn allocate_handle(&self, session: SessionId) -> Option<u32> {
        let s = self.sessions.get(session.0)?;
        let in_use: Vec<u32> = s
            .links
            .iter()
            .filter_map(|id| self.links.get(id.0))
            .filter(|l| !(l.detach_sent && l.state.remote() == RemoteState::Closed))
            .filter_map(|l| l.local_handle)
            .collect();
        (0..=u32::MAX).find(|handle| !in_use.contains(handle))
    }

    fn write_attach(&mut self, session: SessionId, link: LinkId) {
        let l = match self.links.get(link.0) {
            Some(l) => l,
            None => return,
        };
        if l.attach_sent || l.detach_sent || l.state.local() == LocalState::Uninit {
            return;
        }
        if l.state.local() == LocalState::Closed && l.state.remote() == RemoteState::Uninit {
            return;
        }
        let handle = match self.allocate_handle(session) {
            Some(handle) => handle,
            None => return,
        };
        let channel = match self.sessions[session.0].local_channel {
            Some(channel) => channel,
            None => return,
        };

        let l = &mut self.links[link.0];
        l.local_handle = Some(handle);
        l.attach_sent = true;
        let attach = Attach {
            name: l.name.clone(),
            handle: Handle(handle),
            role: l.role.clone(),
            snd_settle_mode: l.snd_settle_mode.clone(),
            rcv_settle_mode: l.rcv_settle_mode.clone(),
            source: l.source.clone().map(Box::new),
            target: l
                .target
                .clone()
                .map(|target| Box::new(TargetArchetype::from(target))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: match l.role {
                Role::Sender => Some(l.delivery_count),
                Role::Receiver => None,
            },
            max_message_size: l.max_message_size,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        // Credit granted before the attach goes out with the first flow
        if l.is_receiver() && l.credit > 0 {
            l.flow_pending = true;
        }
        let _ = self.write_frame(channel, FrameBody::Attach(attach));
    }

    fn session_flow(&self, session: SessionId) -> Option<(u16, Flow)> {
        let s = self.sessions.get(session.0)?;
        let channel = s.local_channel?;
        let flow = Flow {
            next_incoming_id: s.remote_channel.map(|_| s.next_incoming_id),
            incoming_window: s.incoming_credit,
            next_outgoing_id: s.next_outgoing_id,
            outgoing_window: u32::MAX,
            handle: None,
            delivery_count: None,
            link_credit: None,
            available: None,
            drain: false,
            echo: false,
            properties: None,
        };
        Some((channel, flow))
    }

    fn write_session_flow(&mut self, session: SessionId) {
        let pending = self
            .sessions
            .get(session.0)
            .map(|s| s.flow_pending)
            .unwrap_or(false);
        if !pending {
            return;
        }
        // A link flow carries the session fields as well
        let link_flow_pending = self.sessions[session.0].links.iter().any(|id| {
            self.links
                .get(id.0)
                .map(|l| l.flow_pending && l.attach_sent && !l.detach_sent)
                .unwrap_or(false)
        });
        self.sessions[session.0].flow_pending = false;
        if link_flow_pending {
            return;
        }
        if let Some((channel, flow)) = self.session_flow(session) {
            let _ = self.write_frame(channel, FrameBody::Flow(flow));
        }
    }

    fn write_link_flow(&mut self, session: SessionId, link: LinkId) {
        let l = match self.links.get_mut(link.0) {
            Some(l) => l,
            None => return,
        };
        if !l.flow_pending || !l.attach_sent || l.detach_sent {
            return;
        }
        l.flow_pending = false;
        let handle = l.local_handle;
        let delivery_count = l.delivery_count;
        let credit = l.credit;
        let available = l.available;
        let drain = l.drain;
        let is_sender = l.is_sender();

        if let Some((channel, mut flow)) = self.session_flow(session) {
            flow.handle = handle.map(Handle);
            flow.delivery_count = Some(delivery_count);
            flow.link_credit = Some(credit);
            flow.drain = drain;
            if is_sender {
                flow.available = Some(available);
            }
            let _ = self.write_frame(channel, FrameBody::Flow(flow));
        }
    }

    fn write_deliveries(&mut self) {
        let work: Vec<DeliveryId> = self.tpwork.iter().copied().collect();
        let mut keep = Vec::new();
        for id in work {
            if self.write_delivery(id) {
                keep.push(id);
            } else if let Some(d) = self.deliveries.get_mut(&id) {
                d.in_tpwork = false;
            }
        }
        self.tpwork = keep.into();
    }

    /// Writes what is pending for one delivery. Returns whether it stays in the
    /// transport work list.
    fn write_delivery(&mut self, id: DeliveryId) -> bool {
        let (link, session) = match self
            .deliveries
            .get(&id)
            .and_then(|d| self.links.get(d.link.0).map(|l| (d.link, l.session)))
        {
            Some(ids) => ids,
            None => return false,
        };
        let l = &self.links[link.0];
        let s = match self.sessions.get(session.0) {
            Some(s) => s,
            None => return false,
        };
        if l.detach_sent || s.end_sent {
            return false;
        }
        let (handle, channel) = match (l.local_handle, s.local_channel) {
            (Some(handle), Some(channel)) if l.attach_sent && s.begin_sent => (handle, channel),
            _ => return true,
        };
        let pre_settled = matches!(l.snd_settle_mode, SenderSettleMode::Settled);
        let role = l.role.clone();

        let d = match self.deliveries.get_mut(&id) {
            Some(d) => d,
            None => return false,
        };
        let needs_transfer = d.is_outgoing()
            && d.issued
            && !d.transfer_complete
            && (!d.data.is_empty() || d.advanced);

        if needs_transfer {
            let s = &mut self.sessions[session.0];
            if s.remote_incoming_window == 0 {
                return true;
            }
            let first = d.number.is_none();
            let number = match d.number {
                Some(number) => number,
                None => {
                    let number = s.next_delivery_number;
                    s.next_delivery_number = s.next_delivery_number.wrapping_add(1);
                    s.outgoing_deliveries.insert(number, id);
                    d.number = Some(number);
                    number
                }
            };
            let payload = d.data.split().freeze();
            s.outgoing_bytes = s.outgoing_bytes.saturating_sub(payload.len());
            let window = s.remote_incoming_window;
            let more = !d.advanced;
            let settled = d.settled || pre_settled;
            let state = match d.disposition_pending {
                true => d.local.clone(),
                false => None,
            };
            let transfer = Transfer {
                handle: Handle(handle),
                delivery_id: first.then_some(number),
                delivery_tag: first.then(|| d.tag.clone()),
                message_format: first.then_some(0),
                settled: Some(settled),
                more,
                rcv_settle_mode: None,
                state,
                resume: false,
                aborted: false,
                batchable: false,
            };

            let (frames, rest) = match self.write_transfer(channel, transfer, payload, window) {
                Ok(written) => written,
                Err(_) => return false,
            };
            let s = &mut self.sessions[session.0];
            s.next_outgoing_id = s.next_outgoing_id.wrapping_add(frames);
            s.remote_incoming_window = s.remote_incoming_window.saturating_sub(frames);
            s.outgoing_bytes += rest.len();

            let d = match self.deliveries.get_mut(&id) {
                Some(d) => d,
                None => return false,
            };
            if !rest.is_empty() {
                // The peer's window closed in the middle of the delivery
                d.data.extend_from_slice(&rest);
                return true;
            }
            if !more {
                d.transfer_complete = true;
                d.disposition_pending = false;
                d.settle_sent = settled;
            }
            return false;
        }

        let d = match self.deliveries.get_mut(&id) {
            Some(d) => d,
            None => return false,
        };
        let number = match (d.disposition_pending, d.number) {
            (true, Some(number)) if !d.is_outgoing() || d.transfer_complete => number,
            _ => return false,
        };
        d.disposition_pending = false;
        d.settle_sent = d.settled;
        let disposition = Disposition {
            role,
            first: number,
            last: None,
            settled: d.settled,
            state: d.local.clone(),
            batchable: false,
        };
        let _ = self.write_frame(channel, FrameBody::Disposition(disposition));
        false
    }

    fn write_detach(&mut self, session: SessionId, link: LinkId) {
        let l = match self.links.get_mut(link.0) {
            Some(l) => l,
            None => return,
        };
        if l.state.local() != LocalState::Closed || !l.attach_sent || l.detach_sent {
            return;
        }
        let handle = match l.local_handle {
            Some(handle) => handle,
            None => return,
        };
        l.detach_sent = true;
        let detach = Detach {
            handle: Handle(handle),
            closed: l.detach_closes,
            error: l.condition.clone(),
        };
        if let Some(channel) = self.sessions.get(session.0).and_then(|s| s.local_channel) {
            let _ = self.write_frame(channel, FrameBody::Detach(detach));
        }
    }

    fn write_end(&mut self, session: SessionId) {
        let s = match self.sessions.get_mut(session.0) {
            Some(s) => s,
            None => return,
        };
        if s.state.local() != LocalState::Closed || !s.begin_sent || s.end_sent {
            return;
        }
        let channel = match s.local_channel {
            Some(channel) => channel,
            None => return,
        };
        s.end_sent = true;
        let end = End {
            error: s.condition.clone(),
        };
        // Ending the session detaches its links implicitly
        for id in s.links.iter() {
            if let Some(l) = self.links.get_mut(id.0) {
                if l.attach_sent {
                    l.detach_sent = true;
                }
            }
        }
        let _ = self.write_frame(channel, FrameBody::End(end));
    }

    fn write_close(&mut self) {
        if self.state.local() != LocalState::Closed {
            return;
        }
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return,
        };
        if !transport.open_sent || transport.close_sent {
            return;
        }
        transport.close_sent = true;
        let close = Close {
            error: self.condition.clone(),
        };
        let _ = self.write_frame(0, FrameBody::Close(close));
    }

    /// Emits the final events of endpoints nothing more will happen to, links first
    pub(crate) fn check_finals(&mut self) {
        let (transport_closed, close_sent) = match self.transport.as_ref() {
            Some(t) => (t.head_closed && t.tail_closed, t.close_sent),
            None => (false, false),
        };
        let connection_done = transport_closed
            || (self.state.local() == LocalState::Closed
                && self.state.remote() == RemoteState::Closed
                && close_sent);

        let mut events = Vec::new();
        let sessions: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in sessions {
            let s = &self.sessions[key];
            let remote_done = match s.state.remote() {
                RemoteState::Closed => true,
                RemoteState::Uninit => !s.begin_sent,
                RemoteState::Active => false,
            };
            let session_done = connection_done
                || (s.state.local() == LocalState::Closed
                    && remote_done
                    && (s.end_sent || !s.begin_sent));

            for id in s.links.iter() {
                if let Some(l) = self.links.get_mut(id.0) {
                    let remote_done = match l.state.remote() {
                        RemoteState::Closed => true,
                        RemoteState::Uninit => !l.attach_sent,
                        RemoteState::Active => false,
                    };
                    let link_done = session_done
                        || (l.state.local() == LocalState::Closed
                            && remote_done
                            && (l.detach_sent || !l.attach_sent));
                    if link_done && !l.final_emitted {
                        l.final_emitted = true;
                        events.push(Event::link(EventType::LinkFinal, self.id, SessionId(key), *id));
                    }
                }
            }

            let s = &mut self.sessions[key];
            if session_done && !s.final_emitted {
                s.final_emitted = true;
                events.push(Event::session(EventType::SessionFinal, self.id, SessionId(key)));
            }
        }
        if connection_done && !self.final_emitted {
            self.final_emitted = true;
            events.push(Event::connection(EventType::ConnectionFinal, self.id));
        }

        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::{
        event::{Collector, EventType},
        transport::Transport,
        types::definitions::{AmqpError, ErrorCondition},
        Connection,
    };

    fn kinds(collector: &Collector) -> Vec<EventType> {
        std::iter::from_fn(|| collector.pop()).map(|e| e.kind()).collect()
    }

    #[test]
    fn client_writes_header_then_open() {
        let mut conn = Connection::new("client");
        conn.bind(Transport::new()).unwrap();
        conn.open();
        let output = conn.take_output();
        assert_eq!(&output[..8], b"AMQP\x00\x01\x00\x00");
        // Open is a described list with descriptor code 0x10
        assert_eq!(&output[8 + 8..8 + 8 + 3], &[0x00, 0x53, 0x10]);
        assert_eq!(conn.pending(), 0);
    }

    #[test]
    fn local_idle_timeout_closes_the_connection() {
        let collector = Collector::new();
        let mut conn = Connection::builder()
            .container_id("idle")
            .idle_time_out(100u32)
            .build();
        conn.collect(collector.clone());
        conn.open();

        let start = Instant::now();
        let deadline = conn.tick(start);
        assert_eq!(deadline, Some(start + Duration::from_millis(100)));
        assert_eq!(conn.tick(start + Duration::from_millis(150)), None);

        let condition = conn.transport().unwrap().condition().cloned().unwrap();
        assert_eq!(
            condition.condition,
            ErrorCondition::AmqpError(AmqpError::ResourceLimitExceeded)
        );
        assert!(conn.transport().unwrap().is_tail_closed());
        assert!(kinds(&collector).contains(&EventType::TransportError));
    }

    #[test]
    fn heartbeat_is_sent_at_half_the_remote_timeout() {
        let mut conn = Connection::new("heartbeat");
        conn.open();
        let _ = conn.take_output();
        conn.transport_mut().remote_idle_timeout = Some(Duration::from_millis(1000));

        let start = Instant::now();
        assert_eq!(conn.tick(start), Some(start + Duration::from_millis(500)));
        assert_eq!(conn.pending(), 0);
        conn.tick(start + Duration::from_millis(600));
        assert_eq!(conn.take_output().as_ref(), &[0, 0, 0, 8, 2, 0, 0, 0]);
    }

    #[test]
    fn closed_head_discards_output() {
        let collector = Collector::new();
        let mut conn = Connection::new("head");
        conn.collect(collector.clone());
        conn.open();
        conn.close_head();
        assert_eq!(conn.pending(), 0);
        assert!(kinds(&collector).contains(&EventType::TransportHeadClosed));
    }
}
