//! Token change notifications

use std::sync::Arc;

use crate::temporal::TemporalToken;

/// What happened to the provider's current token.
#[derive(Debug, Clone)]
pub enum TokenChange {
    /// The provider obtained its first token (there was no previous one).
    Started { current: Arc<TemporalToken> },
    /// A renewal replaced `previous` with `current`.
    Renewed {
        current: Arc<TemporalToken>,
        previous: Arc<TemporalToken>,
    },
    /// A renewal tick used up its attempts. `last_good` is still current.
    RenewalFailed {
        last_good: Arc<TemporalToken>,
        attempts: u32,
    },
}

impl TokenChange {
    /// The newly obtained token, `None` when renewal failed.
    pub fn current(&self) -> Option<&Arc<TemporalToken>> {
        match self {
            TokenChange::Started { current } | TokenChange::Renewed { current, .. } => {
                Some(current)
            }
            TokenChange::RenewalFailed { .. } => None,
        }
    }

    /// The token that was current before this change.
    pub fn previous(&self) -> Option<&Arc<TemporalToken>> {
        match self {
            TokenChange::Started { .. } => None,
            TokenChange::Renewed { previous, .. } => Some(previous),
            TokenChange::RenewalFailed { last_good, .. } => Some(last_good),
        }
    }

    /// Stable label, used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TokenChange::Started { .. } => "started",
            TokenChange::Renewed { .. } => "renewed",
            TokenChange::RenewalFailed { .. } => "renewal_failed",
        }
    }
}

/// Failure reported by an observer.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ObserverError(String);

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives token change notifications from a provider.
///
/// Called synchronously on the renewal task; keep it short.
pub trait TokenChangeObserver: Send + Sync {
    fn token_changed(&self, change: &TokenChange) -> Result<(), ObserverError>;
}

impl<F> TokenChangeObserver for F
where
    F: Fn(&TokenChange) -> Result<(), ObserverError> + Send + Sync,
{
    fn token_changed(&self, change: &TokenChange) -> Result<(), ObserverError> {
        self(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use token_service::Credential;

    fn token(at: &str) -> Arc<TemporalToken> {
        Arc::new(
            TemporalToken::with_default_unit(Credential::new(at, 60), SystemTime::now()).unwrap(),
        )
    }

    #[test]
    fn accessors_follow_the_variant() {
        let started = TokenChange::Started { current: token("a") };
        assert_eq!(started.current().unwrap().credential().access_token(), "a");
        assert!(started.previous().is_none());
        assert_eq!(started.kind(), "started");

        let renewed = TokenChange::Renewed {
            current: token("b"),
            previous: token("a"),
        };
        assert_eq!(renewed.current().unwrap().credential().access_token(), "b");
        assert_eq!(renewed.previous().unwrap().credential().access_token(), "a");

        let failed = TokenChange::RenewalFailed {
            last_good: token("b"),
            attempts: 3,
        };
        assert!(failed.current().is_none());
        assert_eq!(failed.previous().unwrap().credential().access_token(), "b");
        assert_eq!(failed.kind(), "renewal_failed");
    }

    #[test]
    fn closures_are_observers() {
        let observer = |change: &TokenChange| {
            if change.current().is_none() {
                Err(ObserverError::new("lost token"))
            } else {
                Ok(())
            }
        };
        assert!(observer.token_changed(&TokenChange::Started { current: token("a") }).is_ok());
        let err = observer
            .token_changed(&TokenChange::RenewalFailed {
                last_good: token("a"),
                attempts: 1,
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "lost token");
    }
}
