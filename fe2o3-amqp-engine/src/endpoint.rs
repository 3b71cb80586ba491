//! Endpoint state shared by connections, sessions and links
//!
//! The local and the remote half of the state each move monotonically through
//! `UNINIT -> ACTIVE -> CLOSED`.

use std::fmt;

/// Identifies a [`Connection`](crate::Connection) owned by a reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(pub(crate) usize);

/// Identifies a session within its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) usize);

/// Identifies a link within its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) usize);

/// Identifies a delivery within its connection
///
/// Delivery ids are never reused, a reclaimed delivery simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub(crate) u64);

/// Bitmask state of an endpoint
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointState(u8);

impl EndpointState {
    /// The local endpoint has not yet been opened
    pub const LOCAL_UNINIT: Self = Self(1);

    /// The local endpoint is open
    pub const LOCAL_ACTIVE: Self = Self(2);

    /// The local endpoint has been closed
    pub const LOCAL_CLOSED: Self = Self(4);

    /// The remote endpoint has not yet been opened
    pub const REMOTE_UNINIT: Self = Self(8);

    /// The remote endpoint is open
    pub const REMOTE_ACTIVE: Self = Self(16);

    /// The remote endpoint has been closed
    pub const REMOTE_CLOSED: Self = Self(32);

    const LOCAL_MASK: u8 = 0b0000_0111;
    const REMOTE_MASK: u8 = 0b0011_1000;

    /// State of a freshly created endpoint
    pub const fn new() -> Self {
        Self(Self::LOCAL_UNINIT.0 | Self::REMOTE_UNINIT.0)
    }

    /// Mask matching any state
    pub const fn any() -> Self {
        Self(Self::LOCAL_MASK | Self::REMOTE_MASK)
    }

    /// Raw bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Union of two masks
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The local half of the state
    pub fn local(&self) -> LocalState {
        match self.0 & Self::LOCAL_MASK {
            1 => LocalState::Uninit,
            2 => LocalState::Active,
            _ => LocalState::Closed,
        }
    }

    /// The remote half of the state
    pub fn remote(&self) -> RemoteState {
        match self.0 & Self::REMOTE_MASK {
            8 => RemoteState::Uninit,
            16 => RemoteState::Active,
            _ => RemoteState::Closed,
        }
    }

    /// Whether this state matches a filter mask.
    ///
    /// A mask with no local bits matches every local state, the same holds for the
    /// remote bits.
    pub fn matches(&self, mask: Self) -> bool {
        let local = mask.0 & Self::LOCAL_MASK;
        let remote = mask.0 & Self::REMOTE_MASK;
        (local == 0 || self.0 & local != 0) && (remote == 0 || self.0 & remote != 0)
    }

    /// Moves the local half forward. Returns `false` if the transition would go backward
    /// or is a no-op.
    pub(crate) fn set_local(&mut self, state: LocalState) -> bool {
        if state <= self.local() {
            return false;
        }
        self.0 = (self.0 & Self::REMOTE_MASK) | state.bits();
        true
    }

    /// Moves the remote half forward. Returns `false` if the transition would go backward
    /// or is a no-op.
    pub(crate) fn set_remote(&mut self, state: RemoteState) -> bool {
        if state <= self.remote() {
            return false;
        }
        self.0 = (self.0 & Self::LOCAL_MASK) | state.bits();
        true
    }
}

impl Default for EndpointState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::BitOr for EndpointState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl fmt::Debug for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointState({:?}, {:?})", self.local(), self.remote())
    }
}

/// Local half of an endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalState {
    /// Not yet opened
    Uninit,
    /// Opened
    Active,
    /// Closed
    Closed,
}

impl LocalState {
    fn bits(&self) -> u8 {
        match self {
            LocalState::Uninit => EndpointState::LOCAL_UNINIT.0,
            LocalState::Active => EndpointState::LOCAL_ACTIVE.0,
            LocalState::Closed => EndpointState::LOCAL_CLOSED.0,
        }
    }
}

/// Remote half of an endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemoteState {
    /// Not yet opened by the peer
    Uninit,
    /// Opened by the peer
    Active,
    /// Closed by the peer
    Closed,
}

impl RemoteState {
    fn bits(&self) -> u8 {
        match self {
            RemoteState::Uninit => EndpointState::REMOTE_UNINIT.0,
            RemoteState::Active => EndpointState::REMOTE_ACTIVE.0,
            RemoteState::Closed => EndpointState::REMOTE_CLOSED.0,
        }
    }
}
