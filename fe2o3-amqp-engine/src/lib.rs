#![deny(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A sans-io AMQP 1.0 protocol engine
//!
//! A [`Connection`] owns its sessions, links and deliveries, and drives a
//! [`Transport`](transport::Transport) that turns endpoint changes into frames and
//! frames from the peer into endpoint changes. Bytes move in and out through
//! [`Connection::push`] and [`Connection::take_output`]. The engine never performs
//! I/O on its own.
//!
//! Everything that happens is recorded as an [`Event`] in a [`Collector`]. A
//! [`Reactor`] drains the collector and dispatches events to [`Handler`]s, and with
//! the `net` feature also moves bytes between its connections and TCP sockets.

pub mod connection;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod frames;
pub mod handler;
pub mod link;
pub mod reactor;
pub mod session;
pub mod transport;
pub mod types;

pub use connection::Connection;
pub use delivery::Delivery;
pub use endpoint::{ConnectionId, DeliveryId, EndpointState, LinkId, SessionId};
pub use error::Error;
pub use event::{Collector, Event, EventType};
pub use handler::Handler;
pub use link::Link;
pub use reactor::{Container, Reactor};
pub use session::Session;

/// Default max frame size offered in the open
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65536;

/// Smallest max frame size a peer may announce
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default highest channel number offered in the open
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Default incoming window of a session, in transfers
pub const DEFAULT_INCOMING_WINDOW: u32 = 2048;

/// Default number of outgoing bytes a session buffers
pub const DEFAULT_OUTGOING_CAPACITY: usize = 1 << 20;
