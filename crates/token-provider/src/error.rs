//! Error types for token provider operations

/// Errors from token provider operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A supplied value is out of range or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the provider's current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("unsupported time unit: {0}")]
    UnsupportedUnit(String),

    #[error(transparent)]
    Service(#[from] token_service::Error),
}

/// Result alias for token provider operations.
pub type Result<T> = std::result::Result<T, Error>;
