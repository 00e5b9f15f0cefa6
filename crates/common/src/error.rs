//! Configuration error types shared across the workspace

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Shorthand for a validation failure on a single config field.
    pub fn invalid_field(field: &str, reason: impl std::fmt::Display) -> Self {
        Error::Config(format!("{field}: {reason}"))
    }
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
