//! Credit, transfers and dispositions between two connections pumped in memory

use fe2o3_amqp_engine::{
    error::Error,
    types::{
        accepted, condition,
        definitions::{AmqpError, ConnectionError, ErrorCondition},
        messaging::{DeliveryState, Modified, Received},
        rejected, released,
    },
    Connection, EventType, LinkId,
};

mod common;

use common::{kinds, Pair};

/// Reads the current delivery of a receiver until it is complete
fn read_all(conn: &mut Connection, receiver: LinkId) -> Vec<u8> {
    let mut body = Vec::new();
    let mut buf = [0u8; 64];
    while let Some(n) = conn.recv(receiver, &mut buf).unwrap() {
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body
}

#[test]
fn sending_without_credit_waits_for_flow() {
    let mut pair = Pair::new();
    let (sender, receiver) = pair.open_link();

    let delivery = pair.client.next_delivery(sender).unwrap();
    assert!(matches!(
        pair.client.send(sender, b"hello"),
        Err(Error::FlowControl)
    ));

    pair.server.flow(receiver, 1).unwrap();
    pair.pump();
    assert_eq!(pair.client.get_link(sender).unwrap().credit(), 1);
    assert!(kinds(&pair.client_events).contains(&EventType::LinkFlow));

    assert_eq!(pair.client.send(sender, b"hello").unwrap(), 5);
    assert_eq!(pair.client.get_link(sender).unwrap().credit(), 0);
    pair.client.advance(sender).unwrap();
    pair.pump();

    let incoming = pair.server.get_link(receiver).unwrap().current().unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(pair.server.recv(receiver, &mut buf).unwrap(), Some(5));
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(pair.server.recv(receiver, &mut buf).unwrap(), None);
    assert_eq!(pair.server.get_delivery(incoming).unwrap().tag(), b"0");

    pair.server.update(incoming, accepted()).unwrap();
    pair.server.settle(incoming).unwrap();
    pair.pump();

    let d = pair.client.get_delivery(delivery).unwrap();
    assert!(matches!(d.remote_state(), Some(DeliveryState::Accepted(_))));
    assert!(d.remote_settled());
    assert!(d.updated());
}

#[test]
fn credit_never_goes_negative() {
    let mut pair = Pair::new();
    let (sender, receiver) = pair.open_link();
    pair.server.flow(receiver, 2).unwrap();
    pair.pump();

    for _ in 0..2 {
        pair.client.next_delivery(sender).unwrap();
        pair.client.send(sender, b"x").unwrap();
        pair.client.advance(sender).unwrap();
    }
    pair.client.next_delivery(sender).unwrap();
    assert!(matches!(pair.client.send(sender, b"x"), Err(Error::FlowControl)));
    pair.pump();

    assert_eq!(pair.client.get_link(sender).unwrap().credit(), 0);
    assert_eq!(pair.server.get_link(receiver).unwrap().credit(), 0);
    assert_eq!(pair.server.get_link(receiver).unwrap().delivery_count(), 2);
}

#[test]
fn every_outcome_reaches_the_sender() {
    let outcomes = vec![
        accepted(),
        released(),
        rejected(Some(condition(AmqpError::InternalError, "broken"))),
        DeliveryState::Modified(Modified {
            delivery_failed: Some(true),
            undeliverable_here: None,
            message_annotations: None,
        }),
        DeliveryState::Received(Received {
            section_number: 1,
            section_offset: 42,
        }),
    ];

    let mut pair = Pair::new();
    let (sender, receiver) = pair.open_link();
    pair.server.flow(receiver, outcomes.len() as u32).unwrap();
    pair.pump();

    let mut sent = Vec::new();
    for _ in 0..outcomes.len() {
        sent.push(pair.client.next_delivery(sender).unwrap());
        pair.client.send(sender, b"payload").unwrap();
        pair.client.advance(sender).unwrap();
    }
    pair.pump();

    let received: Vec<_> = pair.server.get_link(receiver).unwrap().deliveries().collect();
    assert_eq!(received.len(), outcomes.len());
    let expected: Vec<String> = outcomes.iter().map(|o| format!("{:?}", o)).collect();
    for (delivery, outcome) in received.iter().zip(outcomes) {
        pair.server.update(*delivery, outcome).unwrap();
    }
    pair.pump();

    for (delivery, outcome) in sent.iter().zip(expected.iter()) {
        let d = pair.client.get_delivery(*delivery).unwrap();
        let state = d.remote_state().expect("peer sent a disposition");
        assert_eq!(&format!("{:?}", state), outcome);
        assert!(!d.remote_settled());
    }
}

#[test]
fn settled_delivery_cannot_be_settled_again() {
    let mut pair = Pair::new();
    let (sender, _) = pair.open_link();
    let delivery = pair.client.next_delivery(sender).unwrap();
    pair.client.settle(delivery).unwrap();
    assert!(matches!(
        pair.client.settle(delivery),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        pair.client.update(delivery, accepted()),
        Err(Error::IllegalState(_))
    ));
}

#[test]
fn remote_close_of_a_link_is_reported() {
    let mut pair = Pair::new();
    let (sender, receiver) = pair.open_link();
    let _ = kinds(&pair.client_events);

    pair.server
        .close_link(receiver, Some(condition(AmqpError::NotAllowed, "go away")))
        .unwrap();
    pair.pump();

    let link = pair.client.get_link(sender).unwrap();
    let remote = link.remote_condition().unwrap();
    assert_eq!(
        remote.condition,
        ErrorCondition::AmqpError(AmqpError::NotAllowed)
    );
    assert_eq!(remote.description.as_deref(), Some("go away"));
    assert!(kinds(&pair.client_events).contains(&EventType::LinkRemoteClose));
}

#[test]
fn send_beyond_the_outgoing_capacity_is_resumed() {
    let mut pair = Pair::with(
        Connection::builder().container_id("client").outgoing_capacity(4),
        Connection::builder().container_id("server"),
    );
    let (sender, receiver) = pair.open_link();
    pair.server.flow(receiver, 1).unwrap();
    pair.pump();

    let body = b"hello world";
    pair.client.next_delivery(sender).unwrap();
    assert_eq!(pair.client.send(sender, body).unwrap(), 4);
    // Nothing more fits until the buffered bytes are framed
    assert_eq!(pair.client.send(sender, &body[4..]).unwrap(), 0);

    let mut offset = 4;
    while offset < body.len() {
        pair.pump();
        let n = pair.client.send(sender, &body[offset..]).unwrap();
        assert!(n > 0 && n <= 4);
        offset += n;
    }
    pair.client.advance(sender).unwrap();
    pair.pump();

    assert_eq!(read_all(&mut pair.server, receiver), body.to_vec());
    let session = pair.client.get_link(sender).unwrap().session();
    assert_eq!(pair.client.get_session(session).unwrap().outgoing_bytes(), 0);
}

#[test]
fn split_transfer_waits_for_the_session_window() {
    let mut pair = Pair::with(
        Connection::builder().container_id("client"),
        Connection::builder()
            .container_id("server")
            .max_frame_size(512u32)
            .incoming_window(2),
    );
    let (sender, receiver) = pair.open_link();
    pair.server.flow(receiver, 1).unwrap();
    pair.pump();

    let session = pair.client.get_link(sender).unwrap().session();
    assert_eq!(
        pair.client.get_session(session).unwrap().remote_incoming_window(),
        2
    );

    let body = vec![9u8; 2000];
    pair.client.next_delivery(sender).unwrap();
    pair.client.send(sender, &body).unwrap();
    pair.client.advance(sender).unwrap();

    // Only as many frames as the peer's window allows go out at once
    let output = pair.client.take_output();
    let mut frames = 0;
    let mut rest = &output[..];
    while rest.len() >= 4 {
        let size = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[size..];
        frames += 1;
    }
    assert_eq!(frames, 2);
    assert_eq!(
        pair.client.get_session(session).unwrap().remote_incoming_window(),
        0
    );

    pair.server.push(&output).unwrap();
    pair.pump();
    assert_eq!(read_all(&mut pair.server, receiver), body);
}

#[test]
fn oversized_delivery_tag_closes_the_connection() {
    let mut pair = Pair::with(
        Connection::builder().container_id("client"),
        Connection::builder().container_id("server").max_frame_size(512u32),
    );
    let (sender, receiver) = pair.open_link();
    pair.server.flow(receiver, 1).unwrap();
    pair.pump();
    let _ = kinds(&pair.client_events);

    let delivery = pair.client.delivery(sender, vec![1u8; 600]).unwrap();
    pair.client.send(sender, b"payload").unwrap();
    pair.client.advance(sender).unwrap();
    pair.pump();

    let transport = pair.client.transport().unwrap();
    assert_eq!(
        transport.condition().unwrap().condition,
        ErrorCondition::ConnectionError(ConnectionError::FramingError)
    );
    assert!(transport.is_closed());
    let events = kinds(&pair.client_events);
    assert!(events.contains(&EventType::TransportError));
    assert!(events.contains(&EventType::TransportClosed));

    // The transfer never made it out
    assert!(pair.client.get_delivery(delivery).unwrap().is_buffered());
    assert_eq!(pair.server.get_link(receiver).unwrap().deliveries().count(), 0);
}
