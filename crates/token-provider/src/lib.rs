//! Auto-renewing access token provider
//!
//! Keeps a current OAuth access token and renews it in the background before
//! it expires, so callers never wait on the authorization server. The
//! provider fetches through any `token_service::TokenService`.
//!
//! Provider lifecycle:
//! 1. `start()` fetches a token, or `resume()` adopts one obtained earlier
//! 2. Observers receive `TokenChange::Started`
//! 3. A background task renews after a fraction (`schedule`, default 0.9) of
//!    the token lifetime, using the refresh token when there is one
//! 4. Failed attempts are retried per the `RetryPolicy`; when a tick runs out
//!    of attempts observers receive `TokenChange::RenewalFailed` and the last
//!    good token stays current
//! 5. `stop()` ends the background task

pub mod change;
pub mod error;
pub mod observable;
pub mod provider;
mod renewal;
pub mod retry;
pub mod temporal;

pub use change::{ObserverError, TokenChange, TokenChangeObserver};
pub use error::{Error, Result};
pub use observable::Observable;
pub use provider::{AutoRenewingProvider, DEFAULT_SCHEDULE, ProviderState};
pub use retry::{FixedRetry, MinimalRetry, NoRetry, RetryPolicy};
pub use temporal::{TemporalToken, TtlUnit};
