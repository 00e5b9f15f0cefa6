//! Grant requests sent to the token endpoint
//!
//! Grant types are plain form payloads here. A `GrantRequest` carries the
//! grant type, client identification, the requested scope and any extra
//! parameters the grant needs (username/password, code, etc).

use std::collections::BTreeSet;

use common::Secret;

pub const CLIENT_CREDENTIALS: &str = "client_credentials";
pub const REFRESH_TOKEN: &str = "refresh_token";

/// Form-encoded grant request.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub grant_type: String,
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub scopes: BTreeSet<String>,
    params: Vec<(String, Secret<String>)>,
}

impl GrantRequest {
    pub fn new(grant_type: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            grant_type: grant_type.into(),
            client_id: client_id.into(),
            client_secret: None,
            scopes: BTreeSet::new(),
            params: Vec::new(),
        }
    }

    pub fn client_credentials(client_id: impl Into<String>, client_secret: Secret<String>) -> Self {
        Self::new(CLIENT_CREDENTIALS, client_id).with_client_secret(client_secret)
    }

    pub fn with_client_secret(mut self, client_secret: Secret<String>) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Add a grant-specific parameter. Values are treated as sensitive.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), Secret::new(value.into())));
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.expose().as_str())
    }

    /// Refresh-token grant for the same client, scoped to `scopes`.
    pub fn renew(&self, refresh_token: &str, scopes: BTreeSet<String>) -> Self {
        let mut grant = Self::new(REFRESH_TOKEN, self.client_id.clone())
            .with_param("refresh_token", refresh_token);
        grant.client_secret = self.client_secret.clone();
        grant.scopes = scopes;
        grant
    }

    /// Form fields in wire order. The client secret is included only when
    /// `include_secret` is set (i.e. not sent via HTTP basic auth).
    pub fn form(&self, include_secret: bool) -> Vec<(&str, &str)> {
        let mut form = vec![
            ("grant_type", self.grant_type.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = self.client_secret.as_ref().filter(|_| include_secret) {
            form.push(("client_secret", secret.expose().as_str()));
        }
        for (name, value) in &self.params {
            form.push((name.as_str(), value.expose().as_str()));
        }
        form
    }

    /// Space-delimited scope, or `None` when no scope was requested.
    pub fn scope_param(&self) -> Option<String> {
        if self.scopes.is_empty() {
            None
        } else {
            Some(self.scopes.iter().cloned().collect::<Vec<_>>().join(" "))
        }
    }
}
