//! Error types for token service operations
//!
//! `Error` covers both transport failures and authorization server protocol
//! errors (RFC 6749 section 5.2). Renewal logic upstream decides whether to
//! retry based on [`Error::is_transient`].

use std::fmt;

use serde::Deserialize;

/// Errors from token service operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("authorization server error: {0}")]
    Protocol(ProtocolError),

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("illegal state: {0}")]
    State(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Whether retrying the same request later may succeed.
    ///
    /// Transport failures and the two protocol errors that signal a server
    /// side condition are transient. Everything else (bad grants, bad
    /// clients, state violations) will fail the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Protocol(err) => matches!(
                err.error_type(),
                Some(ProtocolErrorType::ServerError | ProtocolErrorType::TemporarilyUnavailable)
            ),
            Error::InvalidResponse(_) | Error::State(_) | Error::InvalidArgument(_) => false,
        }
    }
}

/// Result alias for token service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error payload returned by the authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl ProtocolError {
    pub fn new(error: impl Into<String>, description: Option<String>) -> Self {
        Self {
            error: error.into(),
            error_description: description,
            error_uri: None,
            state: None,
        }
    }

    /// The standard error code, or `None` for extension codes.
    pub fn error_type(&self) -> Option<ProtocolErrorType> {
        ProtocolErrorType::parse(&self.error)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{} - {}", self.error, description),
            None => f.write_str(&self.error),
        }
    }
}

/// Standard OAuth 2.0 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorType {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    AccessDenied,
    UnsupportedResponseType,
    ServerError,
    TemporarilyUnavailable,
}

impl ProtocolErrorType {
    const ALL: [ProtocolErrorType; 10] = [
        ProtocolErrorType::InvalidRequest,
        ProtocolErrorType::InvalidClient,
        ProtocolErrorType::InvalidGrant,
        ProtocolErrorType::UnauthorizedClient,
        ProtocolErrorType::UnsupportedGrantType,
        ProtocolErrorType::InvalidScope,
        ProtocolErrorType::AccessDenied,
        ProtocolErrorType::UnsupportedResponseType,
        ProtocolErrorType::ServerError,
        ProtocolErrorType::TemporarilyUnavailable,
    ];

    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolErrorType::InvalidRequest => "invalid_request",
            ProtocolErrorType::InvalidClient => "invalid_client",
            ProtocolErrorType::InvalidGrant => "invalid_grant",
            ProtocolErrorType::UnauthorizedClient => "unauthorized_client",
            ProtocolErrorType::UnsupportedGrantType => "unsupported_grant_type",
            ProtocolErrorType::InvalidScope => "invalid_scope",
            ProtocolErrorType::AccessDenied => "access_denied",
            ProtocolErrorType::UnsupportedResponseType => "unsupported_response_type",
            ProtocolErrorType::ServerError => "server_error",
            ProtocolErrorType::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == code)
    }
}

impl fmt::Display for ProtocolErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
