#![allow(dead_code)]

use fe2o3_amqp_engine::{
    connection::Builder, endpoint::EndpointState, event::Collector, Connection, EventType, LinkId,
    SessionId,
};

/// A client and a server connection, each with its own collector
pub struct Pair {
    pub client: Connection,
    pub server: Connection,
    pub client_events: Collector,
    pub server_events: Collector,
}

impl Pair {
    pub fn new() -> Self {
        Self::with(
            Connection::builder().container_id("client"),
            Connection::builder().container_id("server"),
        )
    }

    /// A pair built from the given builders. The server builder is made a server.
    pub fn with(client: Builder, server: Builder) -> Self {
        let client_events = Collector::new();
        let server_events = Collector::new();
        let mut client = client.build();
        let mut server = server.server().build();
        client.collect(client_events.clone());
        server.collect(server_events.clone());
        Self {
            client,
            server,
            client_events,
            server_events,
        }
    }

    /// Moves bytes both ways until neither side has anything left to write
    pub fn pump(&mut self) {
        pump(&mut self.client, &mut self.server)
    }

    /// Opens both connections, a session and a sender from the client to the
    /// server. Returns the sender and the server's receiver.
    pub fn open_link(&mut self) -> (LinkId, LinkId) {
        self.client.open();
        self.server.open();
        let session = self.client.create_session();
        self.client.open_session(session).unwrap();
        let sender = self.client.create_sender(session, "link").unwrap();
        self.client.open_link(sender).unwrap();
        self.pump();

        let session: SessionId = self
            .server
            .session_head(EndpointState::LOCAL_UNINIT)
            .unwrap();
        self.server.open_session(session).unwrap();
        let receiver = self.server.link_head(EndpointState::LOCAL_UNINIT).unwrap();
        self.server.open_link(receiver).unwrap();
        self.pump();
        (sender, receiver)
    }
}

pub fn pump(a: &mut Connection, b: &mut Connection) {
    loop {
        let from_a = a.take_output();
        if !from_a.is_empty() {
            let _ = b.push(&from_a);
        }
        let from_b = b.take_output();
        if !from_b.is_empty() {
            let _ = a.push(&from_b);
        }
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
    }
}

pub fn kinds(collector: &Collector) -> Vec<EventType> {
    std::iter::from_fn(|| collector.pop())
        .map(|event| event.kind())
        .collect()
}
