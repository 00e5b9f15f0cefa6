//! Prometheus metrics exposition
//!
//! Metrics recorded by the agent:
//!
//! - `token_changes_total` (counter): label `kind` (started, renewed, renewal_failed)
//! - `token_ttl_seconds` (gauge): remaining lifetime of the current token
//!
//! The provider crate records `token_renewal_attempts_total` and
//! `token_renewal_ticks_total` through the same recorder.

use std::sync::Arc;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use token_provider::{ObserverError, TemporalToken, TokenChange, TokenChangeObserver};
use tracing::{info, warn};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition format
/// suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a token change notification.
pub fn record_change(change: &TokenChange) {
    metrics::counter!("token_changes_total", "kind" => change.kind()).increment(1);
    let token = change.current().or(change.previous());
    if let Some(token) = token {
        record_token_ttl(token);
    }
}

/// Set the TTL gauge from `token`.
pub fn record_token_ttl(token: &TemporalToken) {
    metrics::gauge!("token_ttl_seconds").set(token.ttl_left().as_secs_f64());
}

/// Observer that records metrics and logs each change.
pub fn observer() -> Arc<dyn TokenChangeObserver> {
    Arc::new(|change: &TokenChange| -> Result<(), ObserverError> {
        record_change(change);
        match change {
            TokenChange::Started { current } | TokenChange::Renewed { current, .. } => info!(
                kind = change.kind(),
                expires_in = current.credential().expires_in,
                ttl_left_secs = current.ttl_left().as_secs(),
                "access token updated"
            ),
            TokenChange::RenewalFailed { last_good, attempts } => warn!(
                attempts,
                ttl_left_secs = last_good.ttl_left().as_secs(),
                expired = last_good.is_expired(),
                "token renewal failed, serving last good token"
            ),
        }
        Ok(())
    })
}
