//! Secret wrapper for sensitive values
//!
//! Access tokens, refresh tokens and client secrets travel through the
//! workspace inside `Secret` so that structured logging of a credential can
//! never leak the bearer value.

use std::fmt;

use serde::{Deserialize, Deserializer};
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret<String> {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl<'de, T> Deserialize<'de> for Secret<T>
where
    T: Zeroize + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_redacts_debug() {
        let secret = Secret::new(String::from("my-api-key"));
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
        assert!(!debug.contains("my-api-key"));
    }

    #[test]
    fn test_secret_redacts_display() {
        let secret = Secret::from("at_live_123");
        assert_eq!(secret.to_string(), "[REDACTED]");
    }

    #[test]
    fn test_secret_exposes_value() {
        let secret = Secret::new(String::from("my-api-key"));
        assert_eq!(secret.expose(), "my-api-key");
    }

    #[test]
    fn test_secret_deserializes_transparently() {
        #[derive(Deserialize)]
        struct Payload {
            token: Secret<String>,
        }

        let payload: Payload = serde_json::from_str(r#"{"token":"rt_abc"}"#).unwrap();
        assert_eq!(payload.token.expose(), "rt_abc");
        assert_eq!(format!("{:?}", payload.token), "[REDACTED]");
    }
}
