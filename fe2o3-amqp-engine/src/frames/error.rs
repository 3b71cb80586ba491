use std::io;

/// Error encoding or decoding a frame
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Decode error
    #[error("Decode Error {0}")]
    DecodeError(String),

    /// Framing error
    #[error("Framing Error")]
    FramingError,

    /// Unexpected frame type
    #[error("Unexpected frame type {0:#x}")]
    UnexpectedFrameType(u8),
}

impl From<serde_amqp::Error> for Error {
    fn from(err: serde_amqp::Error) -> Self {
        match err {
            serde_amqp::Error::Io(e) => Self::Io(e),
            e => Self::DecodeError(e.to_string()),
        }
    }
}
