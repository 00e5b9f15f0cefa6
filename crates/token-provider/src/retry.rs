//! Retry policies for token renewal
//!
//! A policy is consulted fresh on every renewal tick: how many attempts the
//! tick may make, how long to wait between failed attempts, and whether a
//! given failure is worth another attempt at all.

use std::fmt::Debug;
use std::time::Duration;

use token_service::Error as ServiceError;

/// Strategy for retrying a failed renewal within one tick.
pub trait RetryPolicy: Send + Sync + Debug {
    /// Wait between a failed attempt and the next one.
    fn period_between_retries(&self) -> Duration;

    /// Attempts per tick, including the first.
    fn max_retries(&self) -> u32;

    /// Whether the tick may continue after `error`. Returning `false` ends
    /// the tick without further attempts.
    fn on_error(&self, error: &ServiceError) -> bool;
}

/// One attempt, no retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn period_between_retries(&self) -> Duration {
        Duration::ZERO
    }

    fn max_retries(&self) -> u32 {
        1
    }

    fn on_error(&self, _error: &ServiceError) -> bool {
        false
    }
}

/// Three attempts a minute apart, regardless of the failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimalRetry;

impl MinimalRetry {
    pub const MAX_RETRIES: u32 = 3;
    pub const PERIOD: Duration = Duration::from_secs(60);
}

impl RetryPolicy for MinimalRetry {
    fn period_between_retries(&self) -> Duration {
        Self::PERIOD
    }

    fn max_retries(&self) -> u32 {
        Self::MAX_RETRIES
    }

    fn on_error(&self, _error: &ServiceError) -> bool {
        true
    }
}

/// Configurable attempt count and wait. Gives up on errors that would fail
/// the same way again (see [`ServiceError::is_transient`]).
#[derive(Debug, Clone, Copy)]
pub struct FixedRetry {
    pub max_retries: u32,
    pub period: Duration,
}

impl FixedRetry {
    pub fn new(max_retries: u32, period: Duration) -> Self {
        Self {
            max_retries,
            period,
        }
    }
}

impl RetryPolicy for FixedRetry {
    fn period_between_retries(&self) -> Duration {
        self.period
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn on_error(&self, error: &ServiceError) -> bool {
        error.is_transient()
    }
}
