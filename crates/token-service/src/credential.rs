//! Access token credential model
//!
//! `Credential` is the RFC 6749 section 5.1 token response: bearer value,
//! type, lifetime, optional refresh token and optional granted scope. Token
//! strings are kept in `Secret` so a credential can be logged with `?` safely.

use std::collections::BTreeSet;

use common::Secret;
use serde::{Deserialize, Deserializer};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// An access token as issued by the authorization server.
///
/// `expires_in` is a signed count as received on the wire. Its unit is not
/// part of the payload; consumers interpret it in a configured unit
/// (seconds by default).
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub access_token: Secret<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    /// Granted scope, if the server reported one
    #[serde(default, rename = "scope", deserialize_with = "deserialize_scope")]
    pub scopes: Option<BTreeSet<String>>,
}

impl Credential {
    /// Bearer credential with no refresh token and no scope.
    pub fn new(access_token: impl Into<String>, expires_in: i64) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            token_type: default_token_type(),
            expires_in,
            refresh_token: None,
            scopes: None,
        }
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token.into()));
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    pub fn access_token(&self) -> &str {
        self.access_token.expose()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(|rt| rt.expose().as_str())
    }

    /// `Authorization` header value, `"{token_type} {access_token}"`.
    pub fn authorization_header(&self) -> Secret<String> {
        Secret::new(format!("{} {}", self.token_type, self.access_token()))
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.as_ref().is_some_and(|s| s.contains(scope))
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.access_token() == other.access_token()
            && self.token_type == other.token_type
            && self.expires_in == other.expires_in
            && self.refresh_token() == other.refresh_token()
            && self.scopes == other.scopes
    }
}

impl Eq for Credential {}

/// `scope` arrives either space-delimited (the RFC form) or as a JSON array.
fn deserialize_scope<'de, D>(deserializer: D) -> Result<Option<BTreeSet<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scope {
        Delimited(String),
        List(Vec<String>),
    }

    let scope = Option::<Scope>::deserialize(deserializer)?;
    Ok(scope.map(|s| match s {
        Scope::Delimited(s) => s.split_whitespace().map(str::to_string).collect(),
        Scope::List(list) => list.into_iter().collect(),
    }))
}
