//! SASL negotiation in front of the AMQP protocol header

use fe2o3_amqp_engine::{
    transport::sasl::{Outcome, PlainAuthenticator},
    types::definitions::{AmqpError, ErrorCondition},
    Connection,
};

mod common;

use common::pump;

fn server() -> Connection {
    Connection::builder()
        .container_id("server")
        .server()
        .sasl_authenticator(PlainAuthenticator::new("guest", "secret"))
        .build()
}

fn outcome(conn: &Connection) -> Option<Outcome> {
    conn.transport()
        .and_then(|t| t.sasl_ref())
        .and_then(|sasl| sasl.outcome())
}

#[test]
fn plain_credentials_let_the_open_through() {
    let mut client = Connection::builder()
        .container_id("client")
        .sasl_plain("guest", "secret")
        .build();
    let mut server = server();
    client.open();
    server.open();
    pump(&mut client, &mut server);

    assert_eq!(outcome(&client), Some(Outcome::Ok));
    assert_eq!(outcome(&server), Some(Outcome::Ok));
    assert_eq!(server.remote_container_id(), Some("client"));
    assert_eq!(client.remote_container_id(), Some("server"));
}

#[test]
fn wrong_password_fails_the_client() {
    let mut client = Connection::builder()
        .container_id("client")
        .sasl_plain("guest", "wrong")
        .build();
    let mut server = server();
    client.open();
    pump(&mut client, &mut server);

    assert_eq!(outcome(&server), Some(Outcome::Auth));
    assert_eq!(outcome(&client), Some(Outcome::Auth));
    assert!(client.transport().unwrap().condition().is_some());
    assert_eq!(server.remote_container_id(), None);
}

#[test]
fn skipping_sasl_is_refused_unless_allowed() {
    let mut client = Connection::new("client");
    let mut server = Connection::builder()
        .container_id("server")
        .server()
        .sasl_mechanisms("ANONYMOUS")
        .build();
    client.open();
    pump(&mut client, &mut server);

    assert_eq!(outcome(&server), None);
    let condition = server.condition().unwrap();
    assert_eq!(
        condition.condition,
        ErrorCondition::AmqpError(AmqpError::UnauthorizedAccess)
    );
    assert_eq!(server.remote_container_id(), None);
}

#[test]
fn skipping_sasl_when_allowed() {
    let mut client = Connection::new("client");
    let mut server = Connection::builder()
        .container_id("server")
        .server()
        .sasl_authenticator(PlainAuthenticator::new("guest", "secret"))
        .sasl_allow_skip(true)
        .build();
    client.open();
    server.open();
    pump(&mut client, &mut server);

    assert_eq!(outcome(&server), Some(Outcome::Skipped));
    assert_eq!(server.remote_container_id(), Some("client"));
}
