use crate::{endpoint::LocalState, event::Event};

use super::{Context, Handler, HandlerResult};

/// Default credit window of a [`FlowController`]
pub const DEFAULT_WINDOW: u32 = 1024;

/// Keeps the credit of every open receiver topped up to a window
#[derive(Debug, Clone, Copy)]
pub struct FlowController {
    window: u32,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl FlowController {
    /// Creates a flow controller granting up to `window` credits per receiver
    pub fn new(window: u32) -> Self {
        Self { window }
    }

    /// The credit window
    pub fn window(&self) -> u32 {
        self.window
    }

    fn top_up(&self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        let (connection, link) = match (event.connection_id(), event.link_id()) {
            (Some(connection), Some(link)) => (connection, link),
            _ => return Ok(()),
        };
        let conn = match ctx.connection_mut(connection) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let delta = match conn.get_link(link) {
            Some(l) if l.is_receiver() && l.state().local() != LocalState::Closed => {
                self.window.saturating_sub(l.credit())
            }
            _ => return Ok(()),
        };
        if delta > 0 {
            conn.flow(link, delta)?;
        }
        Ok(())
    }
}

impl Handler for FlowController {
    fn on_link_local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.top_up(ctx, event)
    }

    fn on_link_remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.top_up(ctx, event)
    }

    fn on_link_flow(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.top_up(ctx, event)
    }

    fn on_delivery(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.top_up(ctx, event)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use slab::Slab;

    use crate::{
        endpoint::ConnectionId,
        event::{Event, EventType},
        handler::{dispatch, Context},
        reactor::Timer,
        Connection,
    };

    use super::FlowController;

    #[test]
    fn receiver_credit_is_topped_up_to_the_window() {
        let mut connections = Slab::new();
        let mut conn = Connection::new("flow");
        let session = conn.create_session();
        let receiver = conn.create_receiver(session, "receiver").unwrap();
        let sender = conn.create_sender(session, "sender").unwrap();
        conn.flow(receiver, 3).unwrap();
        connections.insert(conn);

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
        let mut controller = FlowController::new(10);
        for link in [receiver, sender] {
            let event = Event::link(EventType::LinkLocalOpen, ConnectionId(0), session, link);
            dispatch(&mut controller, &mut ctx, &event).unwrap();
        }

        let conn = &connections[0];
        assert_eq!(conn.get_link(receiver).unwrap().credit(), 10);
        assert_eq!(conn.get_link(sender).unwrap().credit(), 0);
    }
}
