//! Token service abstraction
//!
//! The renewal machinery only needs two capabilities from an authorization
//! server: obtain a fresh credential, and exchange a refresh token for a new
//! one. Either may legitimately produce no credential (`Ok(None)`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::credential::Credential;
use crate::error::Result;

/// Boxed future returned by token service operations.
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Credential>>> + Send + 'a>>;

/// Supplier of access tokens.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenService>`).
pub trait TokenService: Send + Sync {
    /// Request a new access token with the configured grant.
    fn fetch(&self) -> TokenFuture<'_>;

    /// Exchange `refresh_token` for a new access token.
    ///
    /// Fails with `Error::State` if the service has no refresh context,
    /// typically because `fetch` was never called.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a>;
}

impl<T: TokenService + ?Sized> TokenService for Arc<T> {
    fn fetch(&self) -> TokenFuture<'_> {
        (**self).fetch()
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
        (**self).refresh(refresh_token)
    }
}

/// Token provider that asks the service for a new token on every call.
///
/// No caching and no renewal; useful for short-lived tools and as a
/// baseline against the auto-renewing provider.
pub struct SimpleTokenProvider<S> {
    service: S,
}

impl<S: TokenService> SimpleTokenProvider<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub async fn get(&self) -> Result<Option<Credential>> {
        self.service.fetch().await
    }
}
