//! Token endpoint transport
//!
//! `TokenEndpoint` posts a grant and maps the response to a credential. The
//! HTTP implementation sends `application/x-www-form-urlencoded` bodies per
//! RFC 6749 section 4 and understands the section 5.2 error payload.

use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::credential::Credential;
use crate::error::{Error, ProtocolError};
use crate::grant::GrantRequest;
use crate::service::TokenFuture;

/// Something a grant can be posted to.
pub trait TokenEndpoint: Send + Sync {
    fn post<'a>(&'a self, path: &'a str, grant: &'a GrantRequest) -> TokenFuture<'a>;
}

/// reqwest-backed token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    base_url: String,
    basic_auth: bool,
}

impl HttpTokenEndpoint {
    /// Endpoint rooted at `base_url`. Client secrets are sent in the form
    /// body unless [`with_basic_auth`](Self::with_basic_auth) is enabled.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            basic_auth: false,
        }
    }

    /// Authenticate the client with HTTP basic auth instead of form fields.
    pub fn with_basic_auth(mut self, enabled: bool) -> Self {
        self.basic_auth = enabled;
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn post<'a>(&'a self, path: &'a str, grant: &'a GrantRequest) -> TokenFuture<'a> {
        Box::pin(async move {
            let url = self.url(path);
            let scope = grant.scope_param();
            let mut form = grant.form(!self.basic_auth);
            if let Some(scope) = scope.as_deref() {
                form.push(("scope", scope));
            }

            let mut request = self
                .client
                .post(&url)
                .header(ACCEPT, "application/json")
                .form(&form);
            if self.basic_auth {
                if let Some(secret) = &grant.client_secret {
                    request = request.basic_auth(&grant.client_id, Some(secret.expose()));
                }
            }

            debug!(url = %url, grant_type = %grant.grant_type, "posting grant");
            let response = request
                .send()
                .await
                .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| Error::Http(format!("reading token response: {e}")))?;

            if status.is_success() {
                if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
                    debug!(%status, "token endpoint returned no token");
                    return Ok(None);
                }
                return serde_json::from_str::<Credential>(&body)
                    .map(Some)
                    .map_err(|e| Error::InvalidResponse(format!("parsing token response: {e}")));
            }

            if let Ok(protocol_error) = serde_json::from_str::<ProtocolError>(&body) {
                return Err(Error::Protocol(protocol_error));
            }

            if status.is_server_error() {
                Err(Error::Http(format!("token endpoint returned {status}: {body}")))
            } else {
                Err(Error::InvalidResponse(format!(
                    "token endpoint returned {status}: {body}"
                )))
            }
        })
    }
}
