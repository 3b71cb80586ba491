//! Event handlers
//!
//! A [`Handler`] has one method per [`EventType`], each of which falls back to
//! [`Handler::on_unhandled`]. [`dispatch`] routes an event to the matching method.
//! Handlers see the engine through a [`Context`], which gives access to the
//! connections and the timer of the reactor that dispatches the event.
//!
//! The convenience methods (`on_connection_opened`, `on_link_error`, ...) are never
//! called by [`dispatch`]. They are called by [`EndpointStateHandler`] on its
//! delegate after it has translated the raw endpoint events.

use std::time::{Duration, Instant};

use slab::Slab;

use crate::{
    event::{Event, EventType},
    reactor::{TaskId, Timer},
    types::Condition,
    Connection, ConnectionId,
};

mod endpoint_state;
mod flow_controller;

pub use endpoint_state::EndpointStateHandler;
pub use flow_controller::FlowController;

/// Error returned by a handler callback
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a handler callback
pub type HandlerResult = Result<(), HandlerError>;

/// What a handler may touch while it handles an event
pub struct Context<'a> {
    pub(crate) connections: &'a mut Slab<Connection>,
    pub(crate) timer: &'a mut Timer,
    pub(crate) stopped: &'a mut bool,
    pub(crate) yielded: &'a mut bool,
    pub(crate) now: Instant,
}

impl<'a> std::fmt::Debug for Context<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("connections", &self.connections.len())
            .field("stopped", &self.stopped)
            .field("yielded", &self.yielded)
            .field("now", &self.now)
            .finish()
    }
}

impl<'a> Context<'a> {
    /// Looks up a connection
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    /// Looks up a connection for modification
    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id.0)
    }

    /// The connection the event is about
    pub fn event_connection(&mut self, event: &Event) -> Option<&mut Connection> {
        event
            .connection_id()
            .and_then(move |id| self.connections.get_mut(id.0))
    }

    /// Schedules a task. A [`EventType::TimerTask`] event for it is dispatched once
    /// `delay` has elapsed, to `handler` if given and to the reactor's handlers
    /// otherwise.
    pub fn schedule(&mut self, delay: Duration, handler: Option<Box<dyn Handler>>) -> TaskId {
        self.timer.schedule(self.now + delay, handler)
    }

    /// Cancels a task that has not fired yet
    pub fn cancel(&mut self, task: TaskId) -> bool {
        self.timer.cancel(task)
    }

    /// Stops the reactor after the current pass
    pub fn stop(&mut self) {
        *self.stopped = true;
    }

    /// Ends the current pass after this event. The events still queued are
    /// dispatched by the next pass.
    pub fn yield_now(&mut self) {
        *self.yielded = true;
    }

    /// Time of the current pass
    pub fn now(&self) -> Instant {
        self.now
    }
}

/// Receives the events of a reactor
///
/// Every method does nothing by default, apart from the raw event methods which
/// call [`Handler::on_unhandled`].
#[allow(unused_variables)]
pub trait Handler {
    /// Called for every raw event without a dedicated override
    fn on_unhandled(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /* -------------------------------- Reactor ------------------------------- */

    /// The reactor has started
    fn on_reactor_init(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// A pass produced no events
    fn on_reactor_quiesced(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// The reactor has stopped
    fn on_reactor_final(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// A scheduled task is due
    fn on_timer_task(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /* ------------------------------ Connection ------------------------------ */

    /// [`EventType::ConnectionInit`]
    fn on_connection_init(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::ConnectionBound`]
    fn on_connection_bound(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::ConnectionUnbound`]
    fn on_connection_unbound(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::ConnectionLocalOpen`]
    fn on_connection_local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::ConnectionRemoteOpen`]
    fn on_connection_remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::ConnectionLocalClose`]
    fn on_connection_local_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::ConnectionRemoteClose`]
    fn on_connection_remote_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::ConnectionFinal`]
    fn on_connection_final(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /* -------------------------------- Session ------------------------------- */

    /// [`EventType::SessionInit`]
    fn on_session_init(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::SessionLocalOpen`]
    fn on_session_local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::SessionRemoteOpen`]
    fn on_session_remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::SessionLocalClose`]
    fn on_session_local_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::SessionRemoteClose`]
    fn on_session_remote_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::SessionFinal`]
    fn on_session_final(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /* --------------------------------- Link --------------------------------- */

    /// [`EventType::LinkInit`]
    fn on_link_init(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkLocalOpen`]
    fn on_link_local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkRemoteOpen`]
    fn on_link_remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkLocalClose`]
    fn on_link_local_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkRemoteClose`]
    fn on_link_remote_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkLocalDetach`]
    fn on_link_local_detach(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkRemoteDetach`]
    fn on_link_remote_detach(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkFlow`]
    fn on_link_flow(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::LinkFinal`]
    fn on_link_final(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /* ------------------------------- Delivery ------------------------------- */

    /// A delivery arrived, received more data or had its remote state updated
    fn on_delivery(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /* ------------------------------- Transport ------------------------------ */

    /// [`EventType::Transport`]
    fn on_transport(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::TransportError`]
    fn on_transport_error(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::TransportHeadClosed`]
    fn on_transport_head_closed(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::TransportTailClosed`]
    fn on_transport_tail_closed(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /// [`EventType::TransportClosed`]
    fn on_transport_closed(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.on_unhandled(ctx, event)
    }

    /* ------------------------- Endpoint state changes ------------------------ */

    /// The peer opened a connection that is not yet open locally
    fn on_connection_opening(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// Both ends of the connection are open
    fn on_connection_opened(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// The peer closed a connection that is still open locally
    fn on_connection_closing(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// Both ends of the connection are closed
    fn on_connection_closed(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// The peer closed the connection with an error
    fn on_connection_error(
        &mut self,
        ctx: &mut Context<'_>,
        event: &Event,
        condition: Option<&Condition>,
    ) -> HandlerResult {
        Ok(())
    }

    /// The peer opened a session that is not yet open locally
    fn on_session_opening(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// Both ends of the session are open
    fn on_session_opened(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// The peer closed a session that is still open locally
    fn on_session_closing(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// Both ends of the session are closed
    fn on_session_closed(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// The peer closed the session with an error
    fn on_session_error(
        &mut self,
        ctx: &mut Context<'_>,
        event: &Event,
        condition: Option<&Condition>,
    ) -> HandlerResult {
        Ok(())
    }

    /// The peer opened a link that is not yet open locally
    fn on_link_opening(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// Both ends of the link are open
    fn on_link_opened(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// The peer closed a link that is still open locally
    fn on_link_closing(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// Both ends of the link are closed
    fn on_link_closed(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }

    /// The peer closed the link with an error
    fn on_link_error(
        &mut self,
        ctx: &mut Context<'_>,
        event: &Event,
        condition: Option<&Condition>,
    ) -> HandlerResult {
        Ok(())
    }

    /// The transport stopped accepting input
    fn on_disconnected(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        Ok(())
    }
}

/// Routes an event to the handler method of its kind
pub fn dispatch<H: Handler + ?Sized>(
    handler: &mut H,
    ctx: &mut Context<'_>,
    event: &Event,
) -> HandlerResult {
    match event.kind() {
        EventType::ReactorInit => handler.on_reactor_init(ctx, event),
        EventType::ReactorQuiesced => handler.on_reactor_quiesced(ctx, event),
        EventType::ReactorFinal => handler.on_reactor_final(ctx, event),
        EventType::TimerTask => handler.on_timer_task(ctx, event),

        EventType::ConnectionInit => handler.on_connection_init(ctx, event),
        EventType::ConnectionBound => handler.on_connection_bound(ctx, event),
        EventType::ConnectionUnbound => handler.on_connection_unbound(ctx, event),
        EventType::ConnectionLocalOpen => handler.on_connection_local_open(ctx, event),
        EventType::ConnectionRemoteOpen => handler.on_connection_remote_open(ctx, event),
        EventType::ConnectionLocalClose => handler.on_connection_local_close(ctx, event),
        EventType::ConnectionRemoteClose => handler.on_connection_remote_close(ctx, event),
        EventType::ConnectionFinal => handler.on_connection_final(ctx, event),

        EventType::SessionInit => handler.on_session_init(ctx, event),
        EventType::SessionLocalOpen => handler.on_session_local_open(ctx, event),
        EventType::SessionRemoteOpen => handler.on_session_remote_open(ctx, event),
        EventType::SessionLocalClose => handler.on_session_local_close(ctx, event),
        EventType::SessionRemoteClose => handler.on_session_remote_close(ctx, event),
        EventType::SessionFinal => handler.on_session_final(ctx, event),

        EventType::LinkInit => handler.on_link_init(ctx, event),
        EventType::LinkLocalOpen => handler.on_link_local_open(ctx, event),
        EventType::LinkRemoteOpen => handler.on_link_remote_open(ctx, event),
        EventType::LinkLocalClose => handler.on_link_local_close(ctx, event),
        EventType::LinkRemoteClose => handler.on_link_remote_close(ctx, event),
        EventType::LinkLocalDetach => handler.on_link_local_detach(ctx, event),
        EventType::LinkRemoteDetach => handler.on_link_remote_detach(ctx, event),
        EventType::LinkFlow => handler.on_link_flow(ctx, event),
        EventType::LinkFinal => handler.on_link_final(ctx, event),

        EventType::Delivery => handler.on_delivery(ctx, event),

        EventType::Transport => handler.on_transport(ctx, event),
        EventType::TransportError => handler.on_transport_error(ctx, event),
        EventType::TransportHeadClosed => handler.on_transport_head_closed(ctx, event),
        EventType::TransportTailClosed => handler.on_transport_tail_closed(ctx, event),
        EventType::TransportClosed => handler.on_transport_closed(ctx, event),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use slab::Slab;

    use crate::{
        event::{Event, EventType},
        reactor::Timer,
    };

    use super::{dispatch, Context, Handler, HandlerResult};

    #[derive(Default)]
    struct Recorder {
        unhandled: Vec<EventType>,
        flows: usize,
    }

    impl Handler for Recorder {
        fn on_unhandled(&mut self, _: &mut Context<'_>, event: &Event) -> HandlerResult {
            self.unhandled.push(event.kind());
            Ok(())
        }

        fn on_link_flow(&mut self, _: &mut Context<'_>, _: &Event) -> HandlerResult {
            self.flows += 1;
            Ok(())
        }
    }

    #[test]
    fn dispatch_falls_back_to_on_unhandled() {
        let mut connections = Slab::new();
        let mut timer = Timer::default();
        let mut stopped = false;
        let mut yielded = false;
        let mut ctx = Context {
            connections: &mut connections,
            timer: &mut timer,
            stopped: &mut stopped,
            yielded: &mut yielded,
            now: Instant::now(),
        };

        let mut recorder = Recorder::default();
        dispatch(&mut recorder, &mut ctx, &Event::new(EventType::ReactorInit)).unwrap();
        dispatch(&mut recorder, &mut ctx, &Event::new(EventType::LinkFlow)).unwrap();

        let mut boxed: Box<dyn Handler> = Box::new(Recorder::default());
        dispatch(boxed.as_mut(), &mut ctx, &Event::new(EventType::ReactorFinal)).unwrap();

        assert_eq!(recorder.unhandled, vec![EventType::ReactorInit]);
        assert_eq!(recorder.flows, 1);
    }
}
