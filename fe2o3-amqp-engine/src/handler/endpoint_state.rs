use std::collections::HashSet;

use crate::{
    endpoint::{ConnectionId, EndpointState, LinkId, LocalState, RemoteState, SessionId},
    event::Event,
    types::Condition,
};

use super::{dispatch, Context, Handler, HandlerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Endpoint {
    Connection(ConnectionId),
    Session(ConnectionId, SessionId),
    Link(ConnectionId, LinkId),
}

impl Endpoint {
    fn of(event: &Event) -> Option<Self> {
        let connection = event.connection_id()?;
        match (event.session_id(), event.link_id()) {
            (_, Some(link)) => Some(Self::Link(connection, link)),
            (Some(session), None) => Some(Self::Session(connection, session)),
            (None, None) => Some(Self::Connection(connection)),
        }
    }

    fn connection(&self) -> ConnectionId {
        match *self {
            Self::Connection(id) | Self::Session(id, _) | Self::Link(id, _) => id,
        }
    }

    fn state(&self, ctx: &Context<'_>) -> Option<EndpointState> {
        let conn = ctx.connection(self.connection())?;
        match *self {
            Self::Connection(_) => Some(conn.state()),
            Self::Session(_, session) => conn.get_session(session).map(|s| s.state()),
            Self::Link(_, link) => conn.get_link(link).map(|l| l.state()),
        }
    }

    fn remote_condition(&self, ctx: &Context<'_>) -> Option<Condition> {
        let conn = ctx.connection(self.connection())?;
        match *self {
            Self::Connection(_) => conn.remote_condition().cloned(),
            Self::Session(_, session) => conn
                .get_session(session)
                .and_then(|s| s.remote_condition().cloned()),
            Self::Link(_, link) => conn.get_link(link).and_then(|l| l.remote_condition().cloned()),
        }
    }

    fn open(&self, ctx: &mut Context<'_>) -> HandlerResult {
        let conn = match ctx.connection_mut(self.connection()) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        match *self {
            Self::Connection(_) => conn.open(),
            Self::Session(_, session) => conn.open_session(session)?,
            Self::Link(_, link) => conn.open_link(link)?,
        }
        Ok(())
    }

    fn close(&self, ctx: &mut Context<'_>, condition: Option<Condition>) -> HandlerResult {
        let conn = match ctx.connection_mut(self.connection()) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        match *self {
            Self::Connection(_) => conn.close(condition),
            Self::Session(_, session) => conn.close_session(session, condition)?,
            Self::Link(_, link) => conn.close_link(link, condition)?,
        }
        Ok(())
    }
}

/// Turns the raw open and close events of connections, sessions and links into
/// the `opening`, `opened`, `closing`, `closed` and `error` callbacks of its
/// delegate.
///
/// An endpoint the peer opens is opened locally, and one the peer closes is
/// closed locally. `opened` and `closed` fire once per endpoint whichever end
/// moves first. A remote close that carries a condition is reported through the
/// `error` callback instead. Without a delegate to report it to, the error is
/// logged and the connection is closed.
pub struct EndpointStateHandler {
    peer_close_is_error: bool,
    delegate: Option<Box<dyn Handler>>,
    opened: HashSet<Endpoint>,
    closed: HashSet<Endpoint>,
}

impl std::fmt::Debug for EndpointStateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointStateHandler")
            .field("peer_close_is_error", &self.peer_close_is_error)
            .field("delegate", &self.delegate.is_some())
            .field("opened", &self.opened)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Default for EndpointStateHandler {
    fn default() -> Self {
        Self::new(false, None)
    }
}

impl EndpointStateHandler {
    /// Creates a handler. With `peer_close_is_error` a remote close without a
    /// condition is reported as an error too, unless a delegate is present.
    pub fn new(peer_close_is_error: bool, delegate: Option<Box<dyn Handler>>) -> Self {
        Self {
            peer_close_is_error,
            delegate,
            opened: HashSet::new(),
            closed: HashSet::new(),
        }
    }

    /// Creates a handler reporting to `delegate`
    pub fn with_delegate(delegate: impl Handler + 'static) -> Self {
        Self::new(false, Some(Box::new(delegate)))
    }

    fn opening(&mut self, ctx: &mut Context<'_>, event: &Event, endpoint: Endpoint) -> HandlerResult {
        match (self.delegate.as_mut(), endpoint) {
            (Some(d), Endpoint::Connection(_)) => d.on_connection_opening(ctx, event),
            (Some(d), Endpoint::Session(..)) => d.on_session_opening(ctx, event),
            (Some(d), Endpoint::Link(..)) => d.on_link_opening(ctx, event),
            (None, _) => Ok(()),
        }
    }

    fn opened(&mut self, ctx: &mut Context<'_>, event: &Event, endpoint: Endpoint) -> HandlerResult {
        if !self.opened.insert(endpoint) {
            return Ok(());
        }
        match (self.delegate.as_mut(), endpoint) {
            (Some(d), Endpoint::Connection(_)) => d.on_connection_opened(ctx, event),
            (Some(d), Endpoint::Session(..)) => d.on_session_opened(ctx, event),
            (Some(d), Endpoint::Link(..)) => d.on_link_opened(ctx, event),
            (None, _) => Ok(()),
        }
    }

    fn closing(&mut self, ctx: &mut Context<'_>, event: &Event, endpoint: Endpoint) -> HandlerResult {
        match (self.delegate.as_mut(), endpoint) {
            (Some(d), Endpoint::Connection(_)) => d.on_connection_closing(ctx, event),
            (Some(d), Endpoint::Session(..)) => d.on_session_closing(ctx, event),
            (Some(d), Endpoint::Link(..)) => d.on_link_closing(ctx, event),
            (None, _) if self.peer_close_is_error => {
                self.closed.insert(endpoint);
                self.error(ctx, event, endpoint, None)
            }
            (None, _) => Ok(()),
        }
    }

    fn closed(&mut self, ctx: &mut Context<'_>, event: &Event, endpoint: Endpoint) -> HandlerResult {
        if !self.closed.insert(endpoint) {
            return Ok(());
        }
        match (self.delegate.as_mut(), endpoint) {
            (Some(d), Endpoint::Connection(_)) => d.on_connection_closed(ctx, event),
            (Some(d), Endpoint::Session(..)) => d.on_session_closed(ctx, event),
            (Some(d), Endpoint::Link(..)) => d.on_link_closed(ctx, event),
            (None, _) => Ok(()),
        }
    }

    fn error(
        &mut self,
        ctx: &mut Context<'_>,
        event: &Event,
        endpoint: Endpoint,
        condition: Option<&Condition>,
    ) -> HandlerResult {
        if let Some(d) = self.delegate.as_mut() {
            return match endpoint {
                Endpoint::Connection(_) => d.on_connection_error(ctx, event, condition),
                Endpoint::Session(..) => d.on_session_error(ctx, event, condition),
                Endpoint::Link(..) => d.on_link_error(ctx, event, condition),
            };
        }

        #[cfg(feature = "tracing")]
        tracing::error!(?endpoint, ?condition, "closed by peer");
        #[cfg(feature = "log")]
        log::error!("closed by peer endpoint={:?} condition={:?}", endpoint, condition);

        match endpoint {
            Endpoint::Connection(_) => Ok(()),
            _ => Endpoint::Connection(endpoint.connection()).close(ctx, condition.cloned()),
        }
    }

    fn local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        let endpoint = match Endpoint::of(event) {
            Some(endpoint) => endpoint,
            None => return Ok(()),
        };
        match endpoint.state(ctx).map(|s| s.remote()) {
            Some(RemoteState::Active) => self.opened(ctx, event, endpoint),
            _ => Ok(()),
        }
    }

    fn remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        let endpoint = match Endpoint::of(event) {
            Some(endpoint) => endpoint,
            None => return Ok(()),
        };
        match endpoint.state(ctx).map(|s| s.local()) {
            Some(LocalState::Active) => self.opened(ctx, event, endpoint),
            Some(LocalState::Uninit) => {
                self.opening(ctx, event, endpoint)?;
                endpoint.open(ctx)?;
                self.opened(ctx, event, endpoint)
            }
            _ => Ok(()),
        }
    }

    fn local_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        let endpoint = match Endpoint::of(event) {
            Some(endpoint) => endpoint,
            None => return Ok(()),
        };
        match endpoint.state(ctx).map(|s| s.remote()) {
            Some(RemoteState::Closed) => self.closed(ctx, event, endpoint),
            _ => Ok(()),
        }
    }

    fn remote_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        let endpoint = match Endpoint::of(event) {
            Some(endpoint) => endpoint,
            None => return Ok(()),
        };
        let local = match endpoint.state(ctx) {
            Some(state) => state.local(),
            None => return Ok(()),
        };

        match endpoint.remote_condition(ctx) {
            Some(condition) => {
                self.closed.insert(endpoint);
                self.error(ctx, event, endpoint, Some(&condition))?;
                endpoint.close(ctx, None)
            }
            None if local == LocalState::Closed => self.closed(ctx, event, endpoint),
            None => {
                self.closing(ctx, event, endpoint)?;
                endpoint.close(ctx, None)?;
                self.closed(ctx, event, endpoint)
            }
        }
    }

    fn forward(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        match self.delegate.as_mut() {
            Some(d) => dispatch(d.as_mut(), ctx, event),
            None => Ok(()),
        }
    }
}

impl Handler for EndpointStateHandler {
    fn on_unhandled(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.forward(ctx, event)
    }

    fn on_connection_local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.local_open(ctx, event)
    }

    fn on_connection_remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.remote_open(ctx, event)
    }

    fn on_connection_local_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.local_close(ctx, event)
    }

    fn on_connection_remote_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.remote_close(ctx, event)
    }

    fn on_session_local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.local_open(ctx, event)
    }

    fn on_session_remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.remote_open(ctx, event)
    }

    fn on_session_local_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.local_close(ctx, event)
    }

    fn on_session_remote_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.remote_close(ctx, event)
    }

    fn on_link_local_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.local_open(ctx, event)
    }

    fn on_link_remote_open(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.remote_open(ctx, event)
    }

    fn on_link_local_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.local_close(ctx, event)
    }

    fn on_link_remote_close(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.remote_close(ctx, event)
    }

    fn on_transport_tail_closed(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        match self.delegate.as_mut() {
            Some(d) => d.on_disconnected(ctx, event),
            None => Ok(()),
        }
    }

    fn on_link_final(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        if let Some(endpoint) = Endpoint::of(event) {
            self.opened.remove(&endpoint);
            self.closed.remove(&endpoint);
        }
        self.forward(ctx, event)
    }

    fn on_session_final(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        if let Some(endpoint) = Endpoint::of(event) {
            self.opened.remove(&endpoint);
            self.closed.remove(&endpoint);
        }
        self.forward(ctx, event)
    }

    fn on_connection_final(&mut self, ctx: &mut Context<'_>, event: &Event) -> HandlerResult {
        if let Some(id) = event.connection_id() {
            self.opened.retain(|e| e.connection() != id);
            self.closed.retain(|e| e.connection() != id);
        }
        self.forward(ctx, event)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Instant};

    use slab::Slab;

    use crate::{
        endpoint::{ConnectionId, LocalState, RemoteState},
        event::{Event, EventType},
        handler::{dispatch, Context, Handler, HandlerResult},
        reactor::Timer,
        types::{condition, definitions::AmqpError, Condition},
        Connection,
    };

    use super::EndpointStateHandler;

    #[derive(Clone, Default)]
    struct Calls(Rc<RefCell<Vec<&'static str>>>);

    impl Calls {
        fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.0.borrow_mut())
        }
    }

    impl Handler for Calls {
        fn on_connection_opening(&mut self, _: &mut Context<'_>, _: &Event) -> HandlerResult {
            self.0.borrow_mut().push("opening");
            Ok(())
        }

        fn on_connection_opened(&mut self, _: &mut Context<'_>, _: &Event) -> HandlerResult {
            self.0.borrow_mut().push("opened");
            Ok(())
        }

        fn on_connection_closing(&mut self, _: &mut Context<'_>, _: &Event) -> HandlerResult {
            self.0.borrow_mut().push("closing");
            Ok(())
        }

        fn on_connection_closed(&mut self, _: &mut Context<'_>, _: &Event) -> HandlerResult {
            self.0.borrow_mut().push("closed");
            Ok(())
        }

        fn on_connection_error(
            &mut self,
            _: &mut Context<'_>,
            _: &Event,
            condition: Option<&Condition>,
        ) -> HandlerResult {
            assert!(condition.is_some());
            self.0.borrow_mut().push("error");
            Ok(())
        }
    }

    fn run(
        handler: &mut EndpointStateHandler,
        connections: &mut Slab<Connection>,
        kind: EventType,
    ) {
        let mut timer = Timer::default();
        let mut stopped = false;
        let mut yielded = false;
        let mut ctx = Context {
            connections,
            timer: &mut timer,
            stopped: &mut stopped,
            yielded: &mut yielded,
            now: Instant::now(),
        };
        let event = Event::connection(kind, ConnectionId(0));
        dispatch(handler, &mut ctx, &event).unwrap();
    }

    #[test]
    fn opened_fires_once_in_either_order() {
        let calls = Calls::default();
        let mut handler = EndpointStateHandler::with_delegate(calls.clone());
        let mut connections = Slab::new();
        connections.insert(Connection::new("a"));

        connections[0].open();
        run(&mut handler, &mut connections, EventType::ConnectionLocalOpen);
        connections[0].state.set_remote(RemoteState::Active);
        run(&mut handler, &mut connections, EventType::ConnectionRemoteOpen);
        run(&mut handler, &mut connections, EventType::ConnectionLocalOpen);
        assert_eq!(calls.take(), vec!["opened"]);
    }

    #[test]
    fn remote_open_opens_locally() {
        let calls = Calls::default();
        let mut handler = EndpointStateHandler::with_delegate(calls.clone());
        let mut connections = Slab::new();
        connections.insert(Connection::new("a"));

        connections[0].state.set_remote(RemoteState::Active);
        run(&mut handler, &mut connections, EventType::ConnectionRemoteOpen);
        assert_eq!(connections[0].state().local(), LocalState::Active);
        run(&mut handler, &mut connections, EventType::ConnectionLocalOpen);
        assert_eq!(calls.take(), vec!["opening", "opened"]);
    }

    #[test]
    fn remote_close_closes_locally() {
        let calls = Calls::default();
        let mut handler = EndpointStateHandler::with_delegate(calls.clone());
        let mut connections = Slab::new();
        connections.insert(Connection::new("a"));
        connections[0].open();
        connections[0].state.set_remote(RemoteState::Active);

        connections[0].state.set_remote(RemoteState::Closed);
        run(&mut handler, &mut connections, EventType::ConnectionRemoteClose);
        assert_eq!(connections[0].state().local(), LocalState::Closed);
        run(&mut handler, &mut connections, EventType::ConnectionLocalClose);
        assert_eq!(calls.take(), vec!["closing", "closed"]);
    }

    #[test]
    fn remote_close_with_condition_is_an_error() {
        let calls = Calls::default();
        let mut handler = EndpointStateHandler::with_delegate(calls.clone());
        let mut connections = Slab::new();
        connections.insert(Connection::new("a"));
        connections[0].open();
        connections[0].remote_condition = Some(condition(AmqpError::InternalError, "broken"));
        connections[0].state.set_remote(RemoteState::Closed);

        run(&mut handler, &mut connections, EventType::ConnectionRemoteClose);
        run(&mut handler, &mut connections, EventType::ConnectionLocalClose);
        assert_eq!(calls.take(), vec!["error"]);
        assert_eq!(connections[0].state().local(), LocalState::Closed);
    }
}
