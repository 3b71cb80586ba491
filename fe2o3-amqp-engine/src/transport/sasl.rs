//! SASL negotiation layer
//!
//! The negotiator moves from [`SaslState::Idle`] through any number of
//! challenge/response exchanges in [`SaslState::Step`] and ends in either
//! [`SaslState::Pass`] or [`SaslState::Fail`].

use bytes::{BufMut, BytesMut};
use serde_amqp::primitives::{Array, Symbol};
use serde_bytes::ByteBuf;

use crate::{
    frames::sasl::Frame,
    types::sasl::{SaslChallenge, SaslCode, SaslInit, SaslMechanisms, SaslOutcome, SaslResponse},
};

/// SASL ANONYMOUS mechanism
pub const ANONYMOUS: &str = "ANONYMOUS";

/// SASL PLAIN mechanism
pub const PLAIN: &str = "PLAIN";

const INITIAL_RECEIVE_SIZE: usize = 16;

/// Error from the SASL negotiator
#[derive(Debug, thiserror::Error)]
pub enum SaslError {
    /// The buffer passed to [`Sasl::recv`] cannot hold the pending data
    #[error("The receive buffer is too small for the pending data")]
    Overflow,

    /// There is no pending data
    #[error("End of stream")]
    Eos,

    /// The operation is not allowed at this point of the negotiation
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// The negotiation ended with a failure outcome
    #[error("SASL negotiation failed with {0:?}")]
    Failed(SaslCode),
}

/// State of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    /// Nothing has been exchanged yet
    Idle,
    /// Negotiation is in progress
    Step,
    /// Authentication succeeded
    Pass,
    /// Authentication failed
    Fail,
}

/// Outcome of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Authentication succeeded
    Ok,
    /// Failed due to the supplied credentials
    Auth,
    /// Failed due to a system error
    Sys,
    /// Failed due to a permanent system error
    Perm,
    /// Failed due to a transient system error
    Temp,
    /// The peer skipped SASL and this was allowed
    Skipped,
}

impl Outcome {
    /// Whether the outcome lets the connection proceed
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Ok | Outcome::Skipped)
    }

    /// Wire code of the outcome, `None` for [`Outcome::Skipped`]
    pub fn code(&self) -> Option<SaslCode> {
        match self {
            Outcome::Ok => Some(SaslCode::Ok),
            Outcome::Auth => Some(SaslCode::Auth),
            Outcome::Sys => Some(SaslCode::Sys),
            Outcome::Perm => Some(SaslCode::SysPerm),
            Outcome::Temp => Some(SaslCode::SysTemp),
            Outcome::Skipped => None,
        }
    }
}

impl From<SaslCode> for Outcome {
    fn from(code: SaslCode) -> Self {
        match code {
            SaslCode::Ok => Outcome::Ok,
            SaslCode::Auth => Outcome::Auth,
            SaslCode::Sys => Outcome::Sys,
            SaslCode::SysPerm => Outcome::Perm,
            SaslCode::SysTemp => Outcome::Temp,
        }
    }
}

/// Which side of the negotiation this end plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslRole {
    /// Sends sasl-init and responses
    Client,
    /// Sends mechanisms, challenges and the outcome
    Server,
}

/// What a server-side authenticator decides after an init or a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Send a challenge and wait for another response
    Challenge(Vec<u8>),

    /// End the negotiation
    Outcome(SaslCode),
}

/// Server side authentication hook
pub trait SaslAuthenticator: Send {
    /// Mechanisms offered to the client
    fn mechanisms(&self) -> Vec<String>;

    /// Called on sasl-init
    fn on_init(
        &mut self,
        mechanism: &str,
        initial_response: Option<&[u8]>,
        hostname: Option<&str>,
    ) -> Verdict;

    /// Called on sasl-response
    fn on_response(&mut self, _response: &[u8]) -> Verdict {
        // No built-in mechanism sends challenges
        Verdict::Outcome(SaslCode::Sys)
    }
}

/// Accepts every ANONYMOUS init
#[derive(Debug, Clone, Default)]
pub struct AnonymousAuthenticator {}

impl SaslAuthenticator for AnonymousAuthenticator {
    fn mechanisms(&self) -> Vec<String> {
        vec![ANONYMOUS.to_string()]
    }

    fn on_init(&mut self, mechanism: &str, _: Option<&[u8]>, _: Option<&str>) -> Verdict {
        match mechanism {
            ANONYMOUS => Verdict::Outcome(SaslCode::Ok),
            _ => Verdict::Outcome(SaslCode::Auth),
        }
    }
}

/// Validates a single PLAIN credential
#[derive(Debug, Clone)]
pub struct PlainAuthenticator {
    username: String,
    password: String,
}

impl PlainAuthenticator {
    /// Creates an authenticator accepting one username/password pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn validate(&self, response: &[u8]) -> Option<SaslCode> {
        let mut split = response.split(|b| *b == 0u8);
        let _authzid = split.next()?;
        let authcid = split.next()?;
        let passwd = split.next()?;
        if self.username.as_bytes() == authcid && self.password.as_bytes() == passwd {
            Some(SaslCode::Ok)
        } else {
            Some(SaslCode::Auth)
        }
    }
}

impl SaslAuthenticator for PlainAuthenticator {
    fn mechanisms(&self) -> Vec<String> {
        vec![PLAIN.to_string()]
    }

    fn on_init(
        &mut self,
        mechanism: &str,
        initial_response: Option<&[u8]>,
        _: Option<&str>,
    ) -> Verdict {
        let code = match (mechanism, initial_response) {
            (PLAIN, Some(response)) => self.validate(response).unwrap_or(SaslCode::Auth),
            _ => SaslCode::Auth,
        };
        Verdict::Outcome(code)
    }
}

/// Initial response of the PLAIN mechanism, `\0username\0password`
pub fn plain_initial_response(username: &str, password: &str) -> Vec<u8> {
    let username = username.as_bytes();
    let password = password.as_bytes();
    let mut buf = Vec::with_capacity(username.len() + password.len() + 2);
    buf.put_u8(0);
    buf.put_slice(username);
    buf.put_u8(0);
    buf.put_slice(password);
    buf
}

/// The SASL negotiator hosted by a transport
pub struct Sasl {
    role: Option<SaslRole>,
    state: SaslState,
    outcome: Option<Outcome>,
    mechanisms: Vec<String>,
    remote_mechanisms: Vec<String>,
    selected: Option<String>,
    allow_skip: bool,
    hostname: Option<String>,
    outgoing: Option<Vec<u8>>,
    incoming: BytesMut,
    authenticator: Option<Box<dyn SaslAuthenticator>>,

    mechanisms_pending: bool,
    mechanisms_sent: bool,
    init_pending: bool,
    init_sent: bool,
    outcome_sent: bool,
}

impl std::fmt::Debug for Sasl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sasl")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .field("mechanisms", &self.mechanisms)
            .field("remote_mechanisms", &self.remote_mechanisms)
            .field("selected", &self.selected)
            .field("allow_skip", &self.allow_skip)
            .finish()
    }
}

impl Default for Sasl {
    fn default() -> Self {
        Self::new()
    }
}

impl Sasl {
    /// Creates an idle negotiator whose role follows the transport
    pub fn new() -> Self {
        Self {
            role: None,
            state: SaslState::Idle,
            outcome: None,
            mechanisms: Vec::new(),
            remote_mechanisms: Vec::new(),
            selected: None,
            allow_skip: false,
            hostname: None,
            outgoing: None,
            incoming: BytesMut::new(),
            authenticator: None,
            mechanisms_pending: false,
            mechanisms_sent: false,
            init_pending: false,
            init_sent: false,
            outcome_sent: false,
        }
    }

    fn has_exchanged(&self) -> bool {
        self.mechanisms_sent || self.init_sent || self.state != SaslState::Idle
    }

    fn set_role(&mut self, role: SaslRole) -> Result<(), SaslError> {
        match self.role {
            Some(current) if current == role => Ok(()),
            Some(_) if self.has_exchanged() => {
                Err(SaslError::IllegalState("role is fixed once negotiation started"))
            }
            _ => {
                self.role = Some(role);
                Ok(())
            }
        }
    }

    /// Plays the client role
    pub fn client(&mut self) -> Result<(), SaslError> {
        self.set_role(SaslRole::Client)
    }

    /// Plays the server role
    pub fn server(&mut self) -> Result<(), SaslError> {
        self.set_role(SaslRole::Server)
    }

    /// The role, if it has been fixed
    pub fn role(&self) -> Option<SaslRole> {
        self.role
    }

    /// Sets the acceptable (server) or offered (client) mechanisms from a space
    /// separated list
    pub fn mechanisms(&mut self, mechanisms: &str) -> Result<(), SaslError> {
        if self.state != SaslState::Idle {
            return Err(SaslError::IllegalState(
                "mechanisms cannot change once negotiation started",
            ));
        }
        self.mechanisms = mechanisms.split_whitespace().map(String::from).collect();
        Ok(())
    }

    /// The locally configured mechanisms
    pub fn allowed_mechanisms(&self) -> &[String] {
        &self.mechanisms
    }

    /// Mechanisms offered by the remote server
    pub fn remote_mechanisms(&self) -> &[String] {
        &self.remote_mechanisms
    }

    /// The mechanism chosen for this negotiation
    pub fn selected_mechanism(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Configures the client for the PLAIN mechanism
    pub fn plain(&mut self, username: &str, password: &str) -> Result<(), SaslError> {
        self.mechanisms(PLAIN)?;
        self.outgoing = Some(plain_initial_response(username, password));
        Ok(())
    }

    /// Installs a server side authenticator
    pub fn set_authenticator(&mut self, authenticator: impl SaslAuthenticator + 'static) {
        self.authenticator = Some(Box::new(authenticator));
    }

    /// Whether a peer may skip SASL and go straight to the AMQP header
    pub fn allow_skip(&mut self, allow: bool) {
        self.allow_skip = allow;
    }

    /// See [`Sasl::allow_skip`]
    pub fn is_skip_allowed(&self) -> bool {
        self.allow_skip
    }

    /// Hostname sent in sasl-init
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    /// Queues challenge (server) or response (client) data
    pub fn send(&mut self, data: &[u8]) -> Result<usize, SaslError> {
        if matches!(self.state, SaslState::Pass | SaslState::Fail) {
            return Err(SaslError::IllegalState("negotiation is over"));
        }
        self.outgoing
            .get_or_insert_with(Vec::new)
            .extend_from_slice(data);
        Ok(data.len())
    }

    /// Number of received bytes not yet read
    pub fn pending(&self) -> usize {
        self.incoming.len()
    }

    /// Reads the pending data in one piece.
    ///
    /// Fails with [`SaslError::Overflow`] if `buf` is too small and with
    /// [`SaslError::Eos`] if nothing is pending.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SaslError> {
        let n = self.incoming.len();
        if n == 0 {
            return Err(SaslError::Eos);
        }
        if buf.len() < n {
            return Err(SaslError::Overflow);
        }
        buf[..n].copy_from_slice(&self.incoming);
        self.incoming.clear();
        Ok(n)
    }

    /// Reads the pending data, growing the read buffer until it fits.
    ///
    /// Returns `None` at end of stream.
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        let mut size = INITIAL_RECEIVE_SIZE;
        loop {
            let mut buf = vec![0u8; size];
            match self.recv(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Some(buf);
                }
                Err(SaslError::Overflow) => size *= 2,
                Err(_) => return None,
            }
        }
    }

    /// Ends the negotiation with an outcome. The outcome cannot change afterwards.
    pub fn done(&mut self, outcome: Outcome) -> Result<(), SaslError> {
        if self.outcome.is_some() {
            return Err(SaslError::IllegalState("outcome is already set"));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(?outcome, "sasl done");
        #[cfg(feature = "log")]
        log::debug!("sasl done outcome={:?}", outcome);

        self.outcome = Some(outcome);
        self.state = match outcome.is_success() {
            true => SaslState::Pass,
            false => SaslState::Fail,
        };
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> SaslState {
        self.state
    }

    /// Outcome, unset until the negotiation ends
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub(crate) fn resolve_role(&mut self, is_server: bool) -> SaslRole {
        *self.role.get_or_insert(match is_server {
            true => SaslRole::Server,
            false => SaslRole::Client,
        })
    }

    /// Whether the SASL layer has nothing left to say on the wire
    pub(crate) fn is_finished(&self) -> bool {
        match (self.role, self.outcome) {
            (_, Some(Outcome::Skipped)) => true,
            (Some(SaslRole::Server), Some(_)) => self.outcome_sent,
            (_, Some(_)) => true,
            _ => false,
        }
    }

    /// Mechanisms a server offers
    fn offered_mechanisms(&self) -> Vec<String> {
        if !self.mechanisms.is_empty() {
            self.mechanisms.clone()
        } else if let Some(authenticator) = &self.authenticator {
            authenticator.mechanisms()
        } else {
            vec![ANONYMOUS.to_string()]
        }
    }

    /// The server received the SASL protocol header
    pub(crate) fn on_header(&mut self) {
        if !self.mechanisms_sent {
            self.mechanisms_pending = true;
        }
    }

    /// The peer skipped SASL
    pub(crate) fn on_skip(&mut self) -> Result<(), SaslError> {
        if self.allow_skip && self.outcome.is_none() && self.state == SaslState::Idle {
            self.done(Outcome::Skipped)
        } else {
            Err(SaslError::IllegalState("SASL is required"))
        }
    }

    fn apply(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Challenge(data) => self.outgoing = Some(data),
            Verdict::Outcome(code) => {
                // An outcome set by the application first wins
                let _ = self.done(code.into());
            }
        }
    }

    pub(crate) fn on_frame(&mut self, frame: Frame) -> Result<(), SaslError> {
        #[cfg(feature = "tracing")]
        tracing::trace!(?frame, "sasl recv");
        #[cfg(feature = "log")]
        log::trace!("sasl recv frame={:?}", frame);

        match (self.role, frame) {
            (Some(SaslRole::Client), Frame::Mechanisms(mechanisms)) => {
                self.remote_mechanisms = mechanisms
                    .sasl_server_mechanisms
                    .0
                    .into_iter()
                    .map(Symbol::into_inner)
                    .collect();
                let selected = match self.mechanisms.is_empty() {
                    false => self
                        .mechanisms
                        .iter()
                        .find(|m| self.remote_mechanisms.contains(m))
                        .cloned(),
                    true => self
                        .remote_mechanisms
                        .iter()
                        .find(|m| m.as_str() == ANONYMOUS)
                        .cloned(),
                };
                match selected {
                    Some(mechanism) => {
                        self.selected = Some(mechanism);
                        self.state = SaslState::Step;
                        self.init_pending = true;
                    }
                    None => {
                        let _ = self.done(Outcome::Auth);
                    }
                }
                Ok(())
            }
            (Some(SaslRole::Client), Frame::Challenge(challenge)) => {
                self.incoming.put_slice(&challenge.challenge);
                Ok(())
            }
            (Some(SaslRole::Client), Frame::Outcome(outcome)) => {
                if let Some(data) = outcome.additional_data {
                    self.incoming.put_slice(&data);
                }
                self.apply(Verdict::Outcome(outcome.code));
                Ok(())
            }
            (Some(SaslRole::Server), Frame::Init(init)) => {
                let mechanism = init.mechanism.into_inner();
                self.state = SaslState::Step;
                self.selected = Some(mechanism.clone());
                if !self.offered_mechanisms().contains(&mechanism) {
                    let _ = self.done(Outcome::Auth);
                    return Ok(());
                }
                let response = init.initial_response.map(ByteBuf::into_vec);
                match self.authenticator.as_mut() {
                    Some(authenticator) => {
                        let verdict = authenticator.on_init(
                            &mechanism,
                            response.as_deref(),
                            init.hostname.as_deref(),
                        );
                        self.apply(verdict);
                    }
                    None => {
                        if let Some(data) = response {
                            self.incoming.put_slice(&data);
                        }
                    }
                }
                Ok(())
            }
            (Some(SaslRole::Server), Frame::Response(response)) => {
                match self.authenticator.as_mut() {
                    Some(authenticator) => {
                        let verdict = authenticator.on_response(&response.response);
                        self.apply(verdict);
                    }
                    None => self.incoming.put_slice(&response.response),
                }
                Ok(())
            }
            _ => Err(SaslError::IllegalState("unexpected SASL frame")),
        }
    }

    pub(crate) fn next_frame(&mut self) -> Option<Frame> {
        let frame = match self.role? {
            SaslRole::Server => {
                if self.mechanisms_pending {
                    self.mechanisms_pending = false;
                    self.mechanisms_sent = true;
                    let offered = self
                        .offered_mechanisms()
                        .into_iter()
                        .map(Symbol::from)
                        .collect::<Vec<_>>();
                    Some(Frame::Mechanisms(SaslMechanisms {
                        sasl_server_mechanisms: Array::from(offered),
                    }))
                } else if !self.mechanisms_sent {
                    None
                } else if let Some(outcome) = self.outcome {
                    match (outcome.code(), self.outcome_sent) {
                        (Some(code), false) => {
                            self.outcome_sent = true;
                            Some(Frame::Outcome(SaslOutcome {
                                code,
                                additional_data: self.outgoing.take().map(ByteBuf::from),
                            }))
                        }
                        _ => None,
                    }
                } else if self.state == SaslState::Step {
                    self.outgoing.take().map(|data| {
                        Frame::Challenge(SaslChallenge {
                            challenge: ByteBuf::from(data),
                        })
                    })
                } else {
                    None
                }
            }
            SaslRole::Client => {
                if self.init_pending {
                    self.init_pending = false;
                    self.init_sent = true;
                    let mechanism = self.selected.clone().unwrap_or_default();
                    Some(Frame::Init(SaslInit {
                        mechanism: Symbol::from(mechanism),
                        initial_response: self.outgoing.take().map(ByteBuf::from),
                        hostname: self.hostname.clone(),
                    }))
                } else if self.init_sent && self.state == SaslState::Step {
                    self.outgoing.take().map(|data| {
                        Frame::Response(SaslResponse {
                            response: ByteBuf::from(data),
                        })
                    })
                } else {
                    None
                }
            }
        };

        #[cfg(feature = "tracing")]
        if let Some(frame) = &frame {
            tracing::trace!(?frame, "sasl send");
        }
        #[cfg(feature = "log")]
        if let Some(frame) = &frame {
            log::trace!("sasl send frame={:?}", frame);
        }

        frame
    }
}

#[cfg(test)]
mod tests {
    use serde_amqp::primitives::{Array, Symbol};
    use serde_bytes::ByteBuf;

    use crate::{
        frames::sasl::Frame,
        types::sasl::{SaslCode, SaslInit, SaslMechanisms, SaslOutcome},
    };

    use super::{
        Outcome, PlainAuthenticator, Sasl, SaslError, SaslRole, SaslState, ANONYMOUS, PLAIN,
    };

    #[test]
    fn receive_grows_the_buffer_until_the_payload_fits() {
        let mut sasl = Sasl::new();
        let payload: Vec<u8> = (0..200u8).collect();
        sasl.incoming.extend_from_slice(&payload);

        let mut small = [0u8; 16];
        assert!(matches!(sasl.recv(&mut small), Err(SaslError::Overflow)));
        assert_eq!(sasl.pending(), 200);

        assert_eq!(sasl.receive(), Some(payload));
        assert_eq!(sasl.receive(), None);
    }

    #[test]
    fn outcome_is_immutable() {
        let mut sasl = Sasl::new();
        sasl.done(Outcome::Auth).unwrap();
        assert_eq!(sasl.state(), SaslState::Fail);
        assert!(sasl.done(Outcome::Ok).is_err());
        assert_eq!(sasl.outcome(), Some(Outcome::Auth));
    }

    #[test]
    fn mechanisms_are_rejected_after_step() {
        let mut sasl = Sasl::new();
        sasl.server().unwrap();
        sasl.mechanisms("PLAIN ANONYMOUS").unwrap();
        sasl.on_header();
        assert!(matches!(sasl.next_frame(), Some(Frame::Mechanisms(_))));

        let init = SaslInit {
            mechanism: Symbol::from(ANONYMOUS),
            initial_response: None,
            hostname: None,
        };
        sasl.on_frame(Frame::Init(init)).unwrap();
        assert_eq!(sasl.state(), SaslState::Step);
        assert!(sasl.mechanisms("PLAIN").is_err());
        assert!(sasl.client().is_err());
    }

    #[test]
    fn client_picks_the_first_offered_mechanism() {
        let mut sasl = Sasl::new();
        sasl.client().unwrap();
        sasl.plain("guest", "secret").unwrap();
        let mechanisms = SaslMechanisms {
            sasl_server_mechanisms: Array::from(vec![Symbol::from(ANONYMOUS), Symbol::from(PLAIN)]),
        };
        sasl.on_frame(Frame::Mechanisms(mechanisms)).unwrap();
        assert_eq!(sasl.selected_mechanism(), Some(PLAIN));

        match sasl.next_frame() {
            Some(Frame::Init(init)) => {
                assert_eq!(init.mechanism.as_str(), PLAIN);
                assert_eq!(
                    init.initial_response.map(ByteBuf::into_vec),
                    Some(b"\0guest\0secret".to_vec())
                );
            }
            other => panic!("expecting sasl-init, found {:?}", other),
        }

        let outcome = SaslOutcome {
            code: SaslCode::Ok,
            additional_data: None,
        };
        sasl.on_frame(Frame::Outcome(outcome)).unwrap();
        assert_eq!(sasl.outcome(), Some(Outcome::Ok));
        assert!(sasl.is_finished());
    }

    #[test]
    fn plain_authenticator_checks_credentials() {
        let mut sasl = Sasl::new();
        sasl.resolve_role(true);
        sasl.set_authenticator(PlainAuthenticator::new("guest", "secret"));
        sasl.on_header();
        let _ = sasl.next_frame();

        let init = SaslInit {
            mechanism: Symbol::from(PLAIN),
            initial_response: Some(ByteBuf::from(b"\0guest\0wrong".to_vec())),
            hostname: None,
        };
        sasl.on_frame(Frame::Init(init)).unwrap();
        assert_eq!(sasl.outcome(), Some(Outcome::Auth));
        assert_eq!(sasl.role(), Some(SaslRole::Server));
        match sasl.next_frame() {
            Some(Frame::Outcome(outcome)) => assert_eq!(outcome.code, SaslCode::Auth),
            other => panic!("expecting sasl-outcome, found {:?}", other),
        }
        assert!(sasl.is_finished());
    }

    #[test]
    fn skipping_requires_permission() {
        let mut sasl = Sasl::new();
        assert!(sasl.on_skip().is_err());
        assert_eq!(sasl.outcome(), None);

        sasl.allow_skip(true);
        sasl.on_skip().unwrap();
        assert_eq!(sasl.outcome(), Some(Outcome::Skipped));
        assert_eq!(sasl.state(), SaslState::Pass);
    }
}
