//! OAuth 2.0 token service library
//!
//! Everything the renewal machinery needs from an authorization server:
//! the credential model, protocol errors, the `TokenService` seam, and an
//! HTTP-backed implementation of it. The crate has no dependency on the
//! agent binary and can be used on its own.
//!
//! Token flow:
//! 1. A `GrantRequest` describes how to obtain a token (client credentials,
//!    password, or any other grant type)
//! 2. `HttpTokenEndpoint` posts it to `{base_url}/{path}`
//! 3. `TokenServiceDelegate::fetch()` returns the `Credential` and remembers
//!    its refresh token
//! 4. `TokenServiceDelegate::refresh()` exchanges the refresh token, keeping
//!    the granted scope stable

pub mod credential;
pub mod delegate;
pub mod endpoint;
pub mod error;
pub mod grant;
pub mod service;

pub use credential::Credential;
pub use delegate::{DEFAULT_TOKEN_PATH, TokenServiceDelegate};
pub use endpoint::{HttpTokenEndpoint, TokenEndpoint};
pub use error::{Error, ProtocolError, ProtocolErrorType, Result};
pub use grant::GrantRequest;
pub use service::{SimpleTokenProvider, TokenFuture, TokenService};
