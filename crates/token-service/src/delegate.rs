//! Token service backed by a token endpoint
//!
//! `TokenServiceDelegate` posts a configured grant to obtain tokens and keeps
//! a refresh context once a refresh token has been issued. Refreshing must
//! not widen or narrow the granted scope: when the server rotates the refresh
//! token, the scope it reports has to match the scope originally granted.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::Secret;
use tracing::{debug, info};

use crate::credential::Credential;
use crate::endpoint::TokenEndpoint;
use crate::error::Error;
use crate::grant::GrantRequest;
use crate::service::{TokenFuture, TokenService};

pub const DEFAULT_TOKEN_PATH: &str = "token";

/// Refresh state left behind by the last credential that carried a refresh token.
#[derive(Debug, Clone)]
struct RefreshContext {
    refresh_token: Secret<String>,
    scopes: BTreeSet<String>,
}

/// [`TokenService`] that talks to a [`TokenEndpoint`].
pub struct TokenServiceDelegate<E> {
    endpoint: E,
    grant: GrantRequest,
    path: String,
    context: Mutex<Option<RefreshContext>>,
}

impl<E: TokenEndpoint> TokenServiceDelegate<E> {
    pub fn new(endpoint: E, grant: GrantRequest) -> Self {
        Self {
            endpoint,
            grant,
            path: DEFAULT_TOKEN_PATH.to_string(),
            context: Mutex::new(None),
        }
    }

    /// Override the endpoint path the grants are posted to.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn grant(&self) -> &GrantRequest {
        &self.grant
    }

    /// Whether a refresh token has been issued and remembered.
    pub fn has_refresh_context(&self) -> bool {
        self.context().is_some()
    }

    fn context(&self) -> MutexGuard<'_, Option<RefreshContext>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prime(&self, credential: &Credential, fallback_scopes: BTreeSet<String>) {
        if let Some(refresh_token) = &credential.refresh_token {
            *self.context() = Some(RefreshContext {
                refresh_token: refresh_token.clone(),
                scopes: credential.scopes.clone().unwrap_or(fallback_scopes),
            });
        }
    }
}

impl<E: TokenEndpoint> TokenService for TokenServiceDelegate<E> {
    fn fetch(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            let credential = self.endpoint.post(&self.path, &self.grant).await?;
            if let Some(credential) = &credential {
                debug!(
                    grant_type = %self.grant.grant_type,
                    expires_in = credential.expires_in,
                    has_refresh_token = credential.refresh_token.is_some(),
                    "token fetched"
                );
                self.prime(credential, self.grant.scopes.clone());
            }
            Ok(credential)
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            let scopes = match self.context().as_ref() {
                Some(ctx) => ctx.scopes.clone(),
                None => {
                    return Err(Error::State(
                        "no refresh context: a token must be fetched before it can be refreshed"
                            .into(),
                    ));
                }
            };

            let grant = self.grant.renew(refresh_token, scopes.clone());
            let Some(mut credential) = self.endpoint.post(&self.path, &grant).await? else {
                return Ok(None);
            };

            let granted = credential.scopes.clone().unwrap_or_else(|| scopes.clone());
            if credential.refresh_token.is_some() && granted != scopes {
                return Err(Error::State(format!(
                    "refreshed scope {granted:?} does not match the original scope {scopes:?}"
                )));
            }

            if credential.refresh_token.is_none() {
                credential.refresh_token = Some(Secret::from(refresh_token));
            } else {
                info!("refresh token rotated");
            }
            credential.scopes = Some(granted.clone());
            self.prime(&credential, granted);

            Ok(Some(credential))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Endpoint that records each grant and replies from a script.
    struct ScriptedEndpoint {
        replies: Mutex<VecDeque<crate::Result<Option<Credential>>>>,
        seen: Mutex<Vec<(String, String, Option<String>, Option<String>)>>,
    }

    impl ScriptedEndpoint {
        fn new(replies: Vec<crate::Result<Option<Credential>>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl TokenEndpoint for ScriptedEndpoint {
        fn post<'a>(&'a self, path: &'a str, grant: &'a GrantRequest) -> TokenFuture<'a> {
            Box::pin(async move {
                self.seen.lock().unwrap().push((
                    path.to_string(),
                    grant.grant_type.clone(),
                    grant.param("refresh_token").map(str::to_string),
                    grant.scope_param(),
                ));
                self.replies.lock().unwrap().pop_front().unwrap_or(Ok(None))
            })
        }
    }

    fn delegate(replies: Vec<crate::Result<Option<Credential>>>) -> TokenServiceDelegate<ScriptedEndpoint> {
        let grant = GrantRequest::client_credentials("agent", Secret::from("s3cret"))
            .with_scopes(["read", "write"]);
        TokenServiceDelegate::new(ScriptedEndpoint::new(replies), grant)
    }

    fn issued(at: &str, rt: &str) -> Credential {
        Credential::new(at, 600)
            .with_refresh_token(rt)
            .with_scopes(["read", "write"])
    }

    #[tokio::test]
    async fn refresh_before_fetch_is_a_state_error() {
        let service = delegate(vec![]);
        let err = service.refresh("rt_1").await.unwrap_err();
        assert!(matches!(err, Error::State(_)), "got: {err:?}");
        assert!(service.endpoint.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_posts_configured_grant_and_primes_context() {
        let service = delegate(vec![Ok(Some(issued("at_1", "rt_1")))]).with_path("oauth/token");

        let cred = service.fetch().await.unwrap().unwrap();
        assert_eq!(cred.access_token(), "at_1");
        assert!(service.has_refresh_context());

        let seen = service.endpoint.seen.lock().unwrap();
        assert_eq!(seen[0].0, "oauth/token");
        assert_eq!(seen[0].1, "client_credentials");
        assert_eq!(seen[0].3.as_deref(), Some("read write"));
    }

    #[tokio::test]
    async fn fetch_without_refresh_token_leaves_no_context() {
        let service = delegate(vec![Ok(Some(Credential::new("at_1", 600)))]);
        service.fetch().await.unwrap();
        assert!(!service.has_refresh_context());
    }

    #[tokio::test]
    async fn refresh_posts_refresh_grant_with_original_scope() {
        let service = delegate(vec![
            Ok(Some(issued("at_1", "rt_1"))),
            Ok(Some(Credential::new("at_2", 600))),
        ]);
        service.fetch().await.unwrap();

        let cred = service.refresh("rt_1").await.unwrap().unwrap();
        assert_eq!(cred.access_token(), "at_2");

        let seen = service.endpoint.seen.lock().unwrap();
        assert_eq!(seen[1].1, "refresh_token");
        assert_eq!(seen[1].2.as_deref(), Some("rt_1"));
        assert_eq!(seen[1].3.as_deref(), Some("read write"));
    }

    #[tokio::test]
    async fn missing_refresh_token_in_response_keeps_the_old_one() {
        let service = delegate(vec![
            Ok(Some(issued("at_1", "rt_1"))),
            Ok(Some(Credential::new("at_2", 600))),
        ]);
        service.fetch().await.unwrap();

        let cred = service.refresh("rt_1").await.unwrap().unwrap();
        assert_eq!(cred.refresh_token(), Some("rt_1"));
        assert!(cred.has_scope("read") && cred.has_scope("write"));
    }

    #[tokio::test]
    async fn rotated_refresh_token_with_narrower_scope_is_rejected() {
        let service = delegate(vec![
            Ok(Some(issued("at_1", "rt_1"))),
            Ok(Some(
                Credential::new("at_2", 600)
                    .with_refresh_token("rt_2")
                    .with_scopes(["read"]),
            )),
        ]);
        service.fetch().await.unwrap();

        let err = service.refresh("rt_1").await.unwrap_err();
        assert!(matches!(err, Error::State(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn rotated_refresh_token_with_same_scope_in_any_order_is_accepted() {
        let service = delegate(vec![
            Ok(Some(issued("at_1", "rt_1"))),
            Ok(Some(
                Credential::new("at_2", 600)
                    .with_refresh_token("rt_2")
                    .with_scopes(["write", "read"]),
            )),
            Ok(Some(Credential::new("at_3", 600))),
        ]);
        service.fetch().await.unwrap();

        let cred = service.refresh("rt_1").await.unwrap().unwrap();
        assert_eq!(cred.refresh_token(), Some("rt_2"));

        let cred = service.refresh("rt_2").await.unwrap().unwrap();
        assert_eq!(cred.access_token(), "at_3");
        assert_eq!(cred.refresh_token(), Some("rt_2"));
    }

    #[tokio::test]
    async fn rotated_refresh_token_without_scope_keeps_previous_scope() {
        let service = delegate(vec![
            Ok(Some(issued("at_1", "rt_1"))),
            Ok(Some(Credential::new("at_2", 600).with_refresh_token("rt_2"))),
        ]);
        service.fetch().await.unwrap();

        let cred = service.refresh("rt_1").await.unwrap().unwrap();
        assert_eq!(cred.refresh_token(), Some("rt_2"));
        assert!(cred.has_scope("read") && cred.has_scope("write"));
    }

    #[tokio::test]
    async fn endpoint_errors_propagate() {
        let service = delegate(vec![Err(Error::Http("connection refused".into()))]);
        let err = service.fetch().await.unwrap_err();
        assert!(err.is_transient());
    }
}
