//! Protocol headers exchanged before any frame

use std::convert::TryFrom;

use bytes::{BufMut, BytesMut};

const PROTOCOL_HEADER_PREFIX: &[u8; 4] = b"AMQP";

/// Size of a protocol header on the wire
pub const PROTOCOL_HEADER_SIZE: usize = 8;

/// `AMQP <id> 1 0 0`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Protocol id
    pub id: ProtocolId,

    /// Major number
    pub major: u8,

    /// Minor number
    pub minor: u8,

    /// Revision number
    pub revision: u8,
}

impl ProtocolHeader {
    /// Header announcing the AMQP layer
    pub const fn amqp() -> Self {
        Self {
            id: ProtocolId::Amqp,
            major: 1,
            minor: 0,
            revision: 0,
        }
    }

    /// Header announcing the SASL layer
    pub const fn sasl() -> Self {
        Self {
            id: ProtocolId::Sasl,
            major: 1,
            minor: 0,
            revision: 0,
        }
    }

    /// Whether the header announces AMQP
    pub fn is_amqp(&self) -> bool {
        matches!(self.id, ProtocolId::Amqp)
    }

    /// Whether the header announces SASL
    pub fn is_sasl(&self) -> bool {
        matches!(self.id, ProtocolId::Sasl)
    }

    /// Whether the version is the only one this engine speaks
    pub fn is_supported_version(&self) -> bool {
        self.major == 1 && self.minor == 0 && self.revision == 0
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let bytes: [u8; PROTOCOL_HEADER_SIZE] = (*self).into();
        dst.put_slice(&bytes);
    }
}

impl From<ProtocolHeader> for [u8; 8] {
    fn from(value: ProtocolHeader) -> Self {
        [
            PROTOCOL_HEADER_PREFIX[0],
            PROTOCOL_HEADER_PREFIX[1],
            PROTOCOL_HEADER_PREFIX[2],
            PROTOCOL_HEADER_PREFIX[3],
            value.id as u8,
            value.major,
            value.minor,
            value.revision,
        ]
    }
}

impl TryFrom<[u8; 8]> for ProtocolHeader {
    type Error = [u8; 8];

    fn try_from(v: [u8; 8]) -> Result<Self, Self::Error> {
        if &v[..4] != PROTOCOL_HEADER_PREFIX {
            return Err(v);
        }
        let id = ProtocolId::try_from(v[4]).map_err(|_| v)?;
        Ok(Self {
            id,
            major: v[5],
            minor: v[6],
            revision: v[7],
        })
    }
}

/// Protocol id carried in the fifth byte of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// Plain AMQP
    Amqp = 0x0,

    /// TLS negotiation
    Tls = 0x2,

    /// SASL negotiation
    Sasl = 0x3,
}

impl TryFrom<u8> for ProtocolId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let val = match value {
            0x0 => Self::Amqp,
            0x2 => Self::Tls,
            0x3 => Self::Sasl,
            _ => return Err(value),
        };
        Ok(val)
    }
}
