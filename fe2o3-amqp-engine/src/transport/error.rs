use std::io;

use crate::{
    frames,
    types::{
        condition,
        definitions::{AmqpError, ConnectionError},
        sasl::SaslCode,
        Condition,
    },
};

/// Transport error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The size prefix of an incoming frame is invalid or exceeds the max frame size
    #[error("Invalid frame length {0}")]
    FrameLength(io::Error),

    /// Error encoding or decoding a frame
    #[error(transparent)]
    Frame(#[from] frames::Error),

    /// The peer sent a protocol header that is not supported
    #[error("Protocol header mismatch {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// Nothing was received for longer than the local idle timeout
    #[error("Idle timeout elapsed")]
    IdleTimeoutElapsed,

    /// The tail of the transport is closed and accepts no more input
    #[error("Transport is closed")]
    Closed,

    /// The SASL negotiation failed
    #[error("SASL negotiation failed with {0:?}")]
    Sasl(SaslCode),
}

impl Error {
    /// The condition a connection is closed with when this error happens
    pub fn condition(&self) -> Condition {
        match self {
            Error::Io(err) => condition(ConnectionError::ConnectionForced, err.to_string()),
            Error::FrameLength(err) => condition(ConnectionError::FramingError, err.to_string()),
            Error::Frame(frames::Error::DecodeError(description)) => {
                condition(AmqpError::DecodeError, description.clone())
            }
            Error::Frame(err) => condition(ConnectionError::FramingError, err.to_string()),
            Error::ProtocolHeaderMismatch(_) => {
                condition(ConnectionError::FramingError, "protocol header mismatch")
            }
            Error::IdleTimeoutElapsed => condition(
                AmqpError::ResourceLimitExceeded,
                "local-idle-timeout expired",
            ),
            Error::Closed => condition(ConnectionError::ConnectionForced, "transport closed"),
            Error::Sasl(code) => condition(
                AmqpError::UnauthorizedAccess,
                format!("SASL authentication failed with {:?}", code),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use crate::types::definitions::{AmqpError, ConnectionError, ErrorCondition};

    use super::Error;

    #[test]
    fn invalid_frame_length_is_a_framing_error() {
        let err = Error::FrameLength(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame size too big",
        ));
        assert_eq!(
            err.condition().condition,
            ErrorCondition::ConnectionError(ConnectionError::FramingError)
        );
    }

    #[test]
    fn socket_error_forces_the_connection_closed() {
        let err = Error::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(
            err.condition().condition,
            ErrorCondition::ConnectionError(ConnectionError::ConnectionForced)
        );
        assert_eq!(
            Error::IdleTimeoutElapsed.condition().condition,
            ErrorCondition::AmqpError(AmqpError::ResourceLimitExceeded)
        );
    }
}
