//! Endpoint state handling and event order through a reactor, with the bytes of
//! two connections shuttled in memory

use std::{cell::RefCell, rc::Rc};

use fe2o3_amqp_engine::{
    endpoint::{EndpointState, LocalState},
    event::Event,
    handler::{Context, EndpointStateHandler, Handler, HandlerResult},
    types::{
        condition,
        definitions::{AmqpError, ErrorCondition},
    },
    Connection, ConnectionId, EventType, Reactor,
};

#[derive(Clone, Default)]
struct Record(Rc<RefCell<Vec<(Option<ConnectionId>, &'static str)>>>);

impl Record {
    fn count(&self, id: ConnectionId, what: &str) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|(conn, name)| *conn == Some(id) && *name == what)
            .count()
    }
}

impl Handler for Record {
    fn on_connection_opened(&mut self, _: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.0.borrow_mut().push((event.connection_id(), "opened"));
        Ok(())
    }

    fn on_connection_closed(&mut self, _: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.0.borrow_mut().push((event.connection_id(), "closed"));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Trace(Rc<RefCell<Vec<(Option<ConnectionId>, EventType)>>>);

impl Trace {
    fn of(&self, id: ConnectionId) -> Vec<EventType> {
        self.0
            .borrow()
            .iter()
            .filter(|(conn, _)| *conn == Some(id))
            .map(|(_, kind)| *kind)
            .collect()
    }
}

impl Handler for Trace {
    fn on_unhandled(&mut self, _: &mut Context<'_>, event: &Event) -> HandlerResult {
        self.0.borrow_mut().push((event.connection_id(), event.kind()));
        Ok(())
    }
}

fn shuttle(reactor: &mut Reactor, from: ConnectionId, to: ConnectionId) -> bool {
    let bytes = match reactor.connection_mut(from) {
        Some(conn) => conn.take_output(),
        None => return false,
    };
    if bytes.is_empty() {
        return false;
    }
    if let Some(conn) = reactor.connection_mut(to) {
        let _ = conn.push(&bytes);
    }
    true
}

fn settle(reactor: &mut Reactor, client: ConnectionId, server: ConnectionId) {
    for _ in 0..32 {
        reactor.process().unwrap();
        let moved = shuttle(reactor, client, server) | shuttle(reactor, server, client);
        if !moved && reactor.collector().is_empty() {
            break;
        }
    }
}

fn setup(record: &Record, trace: &Trace) -> (Reactor, ConnectionId, ConnectionId) {
    let mut reactor = Reactor::builder()
        .handler(EndpointStateHandler::with_delegate(record.clone()))
        .global_handler(trace.clone())
        .build();
    let client = reactor.connection_with(Connection::builder().container_id("client"), None);
    let server = reactor.connection_with(
        Connection::builder().container_id("server").server(),
        None,
    );
    reactor.start();
    (reactor, client, server)
}

#[test]
fn each_side_sees_opened_once() {
    let record = Record::default();
    let trace = Trace::default();
    let (mut reactor, client, server) = setup(&record, &trace);

    reactor.connection_mut(client).unwrap().open();
    settle(&mut reactor, client, server);

    assert_eq!(record.count(client, "opened"), 1);
    assert_eq!(record.count(server, "opened"), 1);
    assert_eq!(
        reactor.get_connection(server).unwrap().state().local(),
        LocalState::Active
    );

    reactor.connection_mut(client).unwrap().close(None);
    settle(&mut reactor, client, server);
    assert_eq!(record.count(client, "closed"), 1);
    assert_eq!(record.count(server, "closed"), 1);
    assert_eq!(record.count(client, "opened"), 1);
}

#[test]
fn events_are_dispatched_in_the_order_they_happened() {
    let record = Record::default();
    let trace = Trace::default();
    let (mut reactor, client, server) = setup(&record, &trace);

    reactor.connection_mut(client).unwrap().open();
    settle(&mut reactor, client, server);

    let client_events = trace.of(client);
    let position = |kind: EventType| client_events.iter().position(|k| *k == kind).unwrap();
    assert_eq!(client_events[0], EventType::ConnectionInit);
    assert!(position(EventType::ConnectionLocalOpen) < position(EventType::ConnectionRemoteOpen));

    let server_events = trace.of(server);
    let position = |kind: EventType| server_events.iter().position(|k| *k == kind).unwrap();
    assert!(position(EventType::ConnectionRemoteOpen) < position(EventType::ConnectionLocalOpen));
}

#[test]
fn local_state_never_moves_backward() {
    let mut conn = Connection::new("monotonic");
    conn.open();
    conn.close(None);
    conn.open();
    assert_eq!(conn.state().local(), LocalState::Closed);

    let session = conn.create_session();
    conn.close_session(session, None).unwrap();
    conn.open_session(session).unwrap();
    assert_eq!(
        conn.get_session(session).unwrap().state().local(),
        LocalState::Closed
    );
}

#[test]
fn link_closed_with_an_error_takes_the_connection_down() {
    let mut reactor = Reactor::builder()
        .handler(EndpointStateHandler::default())
        .build();
    let client = reactor.connection_with(Connection::builder().container_id("client"), None);
    let server = reactor.connection_with(
        Connection::builder().container_id("server").server(),
        None,
    );
    reactor.start();

    let conn = reactor.connection_mut(client).unwrap();
    conn.open();
    let session = conn.create_session();
    conn.open_session(session).unwrap();
    let sender = conn.create_sender(session, "doomed").unwrap();
    conn.open_link(sender).unwrap();
    settle(&mut reactor, client, server);

    let conn = reactor.connection_mut(server).unwrap();
    let receiver = conn.link_head(EndpointState::REMOTE_ACTIVE).unwrap();
    assert_eq!(
        conn.get_link(receiver).unwrap().state().local(),
        LocalState::Active
    );
    conn.close_link(receiver, Some(condition(AmqpError::NotAllowed, "no senders")))
        .unwrap();
    settle(&mut reactor, client, server);

    // Nobody handles the error, so the client closes its connection with it
    let conn = reactor.get_connection(client).unwrap();
    assert_eq!(conn.state().local(), LocalState::Closed);
    let condition = conn.condition().unwrap();
    assert_eq!(
        condition.condition,
        ErrorCondition::AmqpError(AmqpError::NotAllowed)
    );
    assert_eq!(condition.description.as_deref(), Some("no senders"));
    assert_eq!(
        conn.get_link(sender).map(|l| l.state().local()),
        Some(LocalState::Closed)
    );
}

#[derive(Clone, Default)]
struct YieldEach(Rc<RefCell<usize>>);

impl Handler for YieldEach {
    fn on_unhandled(&mut self, ctx: &mut Context<'_>, _: &Event) -> HandlerResult {
        *self.0.borrow_mut() += 1;
        ctx.yield_now();
        Ok(())
    }
}

#[test]
fn handler_can_end_a_pass_early() {
    let seen = YieldEach::default();
    let mut reactor = Reactor::builder().handler(seen.clone()).build();
    reactor.connection_with(Connection::builder().container_id("a"), None);
    reactor.start();

    reactor.process().unwrap();
    assert_eq!(*seen.0.borrow(), 1);
    assert!(!reactor.collector().is_empty());

    reactor.process().unwrap();
    assert_eq!(*seen.0.borrow(), 2);
}
