//! Errors returned by the engine API

use crate::transport::sasl::SaslError;

/// Error returned by operations on endpoints and deliveries
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation is not allowed in the current state of the entity
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// A delivery was issued on a link without credit
    #[error("Flow control: the link has no credit")]
    FlowControl,

    /// The id does not refer to a live entity
    #[error("Not found: the entity has been freed or never existed")]
    NotFound,

    /// Error from the SASL layer
    #[error(transparent)]
    Sasl(#[from] SaslError),
}
