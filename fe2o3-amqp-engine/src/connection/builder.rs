use std::{collections::HashMap, collections::VecDeque, time::Duration};

use serde_amqp::primitives::Symbol;
use slab::Slab;

use crate::{
    endpoint::{ConnectionId, EndpointState},
    session::SessionDefaults,
    transport::{
        sasl::{Sasl, SaslAuthenticator},
        Transport,
    },
    types::{
        definitions::{Fields, Milliseconds},
        performatives::{ChannelMax, MaxFrameSize},
    },
    DEFAULT_CHANNEL_MAX, DEFAULT_INCOMING_WINDOW, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_OUTGOING_CAPACITY, MIN_MAX_FRAME_SIZE,
};

use super::Connection;

/// Connection builder
///
/// The transport settings end up in the transport the connection binds on first use.
pub struct Builder {
    /// Container id sent in the open
    pub container_id: String,

    /// Hostname sent in the open
    pub hostname: Option<String>,

    /// Local max frame size, at least 512
    pub max_frame_size: MaxFrameSize,

    /// Highest channel number the local end may use
    pub channel_max: ChannelMax,

    /// Local idle timeout in milliseconds
    pub idle_time_out: Option<Milliseconds>,

    /// Capabilities offered to the peer
    pub offered_capabilities: Option<Vec<Symbol>>,

    /// Capabilities desired from the peer
    pub desired_capabilities: Option<Vec<Symbol>>,

    /// Connection properties
    pub properties: Option<Fields>,

    /// Incoming window of new sessions, in transfer frames
    pub incoming_window: u32,

    /// Outgoing capacity of new sessions, in bytes
    pub outgoing_capacity: usize,

    /// Whether the transport plays the server role
    pub is_server: bool,

    sasl: Option<Sasl>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("container_id", &self.container_id)
            .field("hostname", &self.hostname)
            .field("max_frame_size", &self.max_frame_size)
            .field("channel_max", &self.channel_max)
            .field("idle_time_out", &self.idle_time_out)
            .field("is_server", &self.is_server)
            .field("sasl", &self.sasl)
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with default settings
    pub fn new() -> Self {
        Self {
            container_id: String::new(),
            hostname: None,
            max_frame_size: MaxFrameSize(DEFAULT_MAX_FRAME_SIZE),
            channel_max: ChannelMax(DEFAULT_CHANNEL_MAX),
            idle_time_out: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            incoming_window: DEFAULT_INCOMING_WINDOW,
            outgoing_capacity: DEFAULT_OUTGOING_CAPACITY,
            is_server: false,
            sasl: None,
        }
    }

    /// Container id
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    /// Hostname
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Max frame size. Values below 512 are raised to 512.
    pub fn max_frame_size(mut self, max_frame_size: impl Into<MaxFrameSize>) -> Self {
        let max_frame_size = max_frame_size.into();
        self.max_frame_size = MaxFrameSize(std::cmp::max(MIN_MAX_FRAME_SIZE, max_frame_size.0));
        self
    }

    /// Channel max
    pub fn channel_max(mut self, channel_max: impl Into<ChannelMax>) -> Self {
        self.channel_max = channel_max.into();
        self
    }

    /// Idle timeout in milliseconds
    pub fn idle_time_out(mut self, idle_time_out: impl Into<Milliseconds>) -> Self {
        self.idle_time_out = Some(idle_time_out.into());
        self
    }

    /// Adds an offered capability
    pub fn add_offered_capabilities(mut self, capability: impl Into<Symbol>) -> Self {
        self.offered_capabilities
            .get_or_insert_with(Vec::new)
            .push(capability.into());
        self
    }

    /// Adds a desired capability
    pub fn add_desired_capabilities(mut self, capability: impl Into<Symbol>) -> Self {
        self.desired_capabilities
            .get_or_insert_with(Vec::new)
            .push(capability.into());
        self
    }

    /// Connection properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Incoming window of new sessions
    pub fn incoming_window(mut self, window: u32) -> Self {
        self.incoming_window = window.max(1);
        self
    }

    /// Outgoing capacity of new sessions
    pub fn outgoing_capacity(mut self, capacity: usize) -> Self {
        self.outgoing_capacity = capacity;
        self
    }

    /// Makes the transport play the server role
    pub fn server(mut self) -> Self {
        self.is_server = true;
        self
    }

    /// Enables SASL with the given space separated mechanisms
    pub fn sasl_mechanisms(mut self, mechanisms: &str) -> Self {
        // Only fails once negotiation has started
        let _ = self.sasl.get_or_insert_with(Sasl::new).mechanisms(mechanisms);
        self
    }

    /// Enables SASL PLAIN on the client side
    pub fn sasl_plain(mut self, username: &str, password: &str) -> Self {
        let _ = self.sasl.get_or_insert_with(Sasl::new).plain(username, password);
        self
    }

    /// Enables SASL ANONYMOUS on the client side
    pub fn sasl_anonymous(self) -> Self {
        self.sasl_mechanisms(crate::transport::sasl::ANONYMOUS)
    }

    /// Enables SASL on the server side with an authenticator
    pub fn sasl_authenticator(mut self, authenticator: impl SaslAuthenticator + 'static) -> Self {
        self.sasl
            .get_or_insert_with(Sasl::new)
            .set_authenticator(authenticator);
        self
    }

    /// Whether a peer may skip SASL
    pub fn sasl_allow_skip(mut self, allow: bool) -> Self {
        self.sasl.get_or_insert_with(Sasl::new).allow_skip(allow);
        self
    }

    /// Builds the connection together with its not yet bound transport
    pub fn build(self) -> Connection {
        let mut transport = match self.is_server {
            true => Transport::server(),
            false => Transport::new(),
        };
        transport.set_max_frame_size(self.max_frame_size.0);
        transport.set_channel_max(self.channel_max.0);
        transport.set_idle_timeout(
            self.idle_time_out
                .map(|ms| Duration::from_millis(ms as u64)),
        );
        if let Some(mut sasl) = self.sasl {
            if let Some(hostname) = &self.hostname {
                sasl.set_hostname(hostname.clone());
            }
            transport.sasl = Some(sasl);
        }

        Connection {
            id: ConnectionId::default(),
            state: EndpointState::new(),
            condition: None,
            remote_condition: None,
            container_id: self.container_id,
            hostname: self.hostname,
            offered_capabilities: self.offered_capabilities,
            desired_capabilities: self.desired_capabilities,
            properties: self.properties,
            remote_open: None,
            sessions: Slab::new(),
            links: Slab::new(),
            deliveries: HashMap::new(),
            next_delivery_id: 0,
            work_list: VecDeque::new(),
            tpwork: VecDeque::new(),
            session_defaults: SessionDefaults {
                incoming_window: self.incoming_window,
                outgoing_capacity: self.outgoing_capacity,
            },
            transport: Some(transport),
            bound: false,
            collector: None,
            final_emitted: false,
        }
    }
}
