//! Auto-renewing token provider
//!
//! Holds the current access token and keeps it fresh in the background.
//!
//! Lifecycle:
//! - **Idle**: created, no token yet. `get()` returns `None`.
//! - **Starting**: initial fetch in flight; a second `start()` is rejected.
//! - **Active**: a token is held and the renewal task is running.
//! - **Stopped**: the renewal task has ended. Terminal; the last token can
//!   seed a new provider through [`AutoRenewingProvider::resume`].
//!
//! Reads never wait on renewal: the current token sits in a `watch` channel
//! and is swapped in one step when a renewal succeeds.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use token_service::{Credential, TokenService};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::change::{TokenChange, TokenChangeObserver};
use crate::error::{Error, Result};
use crate::observable::Observable;
use crate::renewal::{CurrentToken, Observers, RenewalTask, publish};
use crate::retry::{NoRetry, RetryPolicy};
use crate::temporal::{TemporalToken, TtlUnit};

/// Default fraction of a token's lifetime after which it is renewed.
pub const DEFAULT_SCHEDULE: f64 = 0.9;

/// Observable lifecycle state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Idle,
    Starting,
    Active,
    Stopped,
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderState::Idle => "idle",
            ProviderState::Starting => "starting",
            ProviderState::Active => "active",
            ProviderState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

enum Job {
    Idle,
    Starting,
    Active {
        handle: JoinHandle<()>,
        shutdown: watch::Sender<bool>,
    },
    Stopped,
}

impl Job {
    fn state(&self) -> ProviderState {
        match self {
            Job::Idle => ProviderState::Idle,
            Job::Starting => ProviderState::Starting,
            Job::Active { .. } => ProviderState::Active,
            Job::Stopped => ProviderState::Stopped,
        }
    }
}

/// Returns the job to Idle if a start is abandoned before it completes.
struct StartGuard<'a> {
    job: &'a Mutex<Job>,
    armed: bool,
}

impl StartGuard<'_> {
    fn complete(mut self, job: Job) {
        self.armed = false;
        *lock(self.job) = job;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut job = lock(self.job);
            if matches!(*job, Job::Starting) {
                *job = Job::Idle;
            }
        }
    }
}

/// Aborts the renewal task if a graceful stop is cancelled mid-wait.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn lock(job: &Mutex<Job>) -> MutexGuard<'_, Job> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Token provider that renews its token before it expires.
pub struct AutoRenewingProvider {
    service: Arc<dyn TokenService>,
    retry: Arc<dyn RetryPolicy>,
    ttl_unit: TtlUnit,
    strict_refresh: bool,
    schedule: Mutex<f64>,
    current: Arc<CurrentToken>,
    observers: Arc<Observers>,
    job: Mutex<Job>,
}

impl AutoRenewingProvider {
    /// Provider with no retries, TTLs in seconds, renewing at 90% of the
    /// token lifetime.
    pub fn new(service: Arc<dyn TokenService>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            service,
            retry: Arc::new(NoRetry),
            ttl_unit: TtlUnit::Seconds,
            strict_refresh: false,
            schedule: Mutex::new(DEFAULT_SCHEDULE),
            current: Arc::new(current),
            observers: Arc::new(Observable::new()),
            job: Mutex::new(Job::Idle),
        }
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    /// Unit in which credentials' `expires_in` is interpreted.
    pub fn with_ttl_unit(mut self, unit: TtlUnit) -> Self {
        self.ttl_unit = unit;
        self
    }

    /// Only ever renew through the refresh token; tokens without one are
    /// rejected up front.
    pub fn with_strict_refresh(mut self, strict: bool) -> Self {
        self.strict_refresh = strict;
        self
    }

    /// Renew after `fraction` of each token's lifetime. Must be in `(0, 1]`.
    ///
    /// Takes effect on the next `start()`/`resume()`.
    pub fn schedule(&self, fraction: f64) -> Result<()> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "schedule must be in (0, 1], got {fraction}"
            )));
        }
        *self.schedule.lock().unwrap_or_else(PoisonError::into_inner) = fraction;
        Ok(())
    }

    fn fraction(&self) -> f64 {
        *self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ProviderState {
        lock(&self.job).state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ProviderState::Active
    }

    /// The current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.current
            .borrow()
            .as_ref()
            .map(|token| token.credential().clone())
    }

    pub fn current_token(&self) -> Option<Arc<TemporalToken>> {
        self.current.borrow().clone()
    }

    /// Receiver that sees every token swap.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<TemporalToken>>> {
        self.current.subscribe()
    }

    pub fn attach(&self, observer: Arc<dyn TokenChangeObserver>) -> Arc<dyn TokenChangeObserver> {
        self.observers.attach(observer)
    }

    pub fn detach(&self, observer: &Arc<dyn TokenChangeObserver>) -> bool {
        self.observers.detach(observer)
    }

    /// Delay between renewals for the current token.
    pub fn estimated_repetitions_delay(&self) -> Result<Duration> {
        let token = self
            .current_token()
            .ok_or_else(|| Error::IllegalState("no token to estimate for".into()))?;
        self.delay_for(&token)
    }

    fn delay_for(&self, token: &TemporalToken) -> Result<Duration> {
        let expires_in = token.credential().expires_in;
        if expires_in < 1 {
            return Err(Error::InvalidArgument(format!(
                "the token has no valid expires_in property: {expires_in}"
            )));
        }
        let count = (expires_in as f64 * self.fraction()).round() as u64;
        token.ttl_unit().duration_of(count).ok_or_else(|| {
            Error::InvalidArgument(format!("renewal period of {count} {} overflows", token.ttl_unit()))
        })
    }

    /// Move Idle to Starting, or explain why not.
    fn begin(&self) -> Result<StartGuard<'_>> {
        let mut job = lock(&self.job);
        match *job {
            Job::Idle => {
                *job = Job::Starting;
                Ok(StartGuard {
                    job: &self.job,
                    armed: true,
                })
            }
            Job::Starting | Job::Active { .. } => {
                Err(Error::IllegalState("already started".into()))
            }
            Job::Stopped => Err(Error::IllegalState(
                "provider has been stopped and cannot be restarted".into(),
            )),
        }
    }

    /// Checks shared by `start` and `resume`, done before anything is published.
    fn renewal_period(&self, token: &TemporalToken) -> Result<Duration> {
        if self.strict_refresh && token.credential().refresh_token.is_none() {
            return Err(Error::InvalidArgument(
                "strict refresh requires a token with a refresh token".into(),
            ));
        }
        let period = self.delay_for(token)?;
        if period.is_zero() {
            return Err(Error::InvalidArgument(format!(
                "renewal period for expires_in {} rounds to zero",
                token.credential().expires_in
            )));
        }
        Ok(period)
    }

    /// Publish `token` and spawn the renewal loop.
    fn activate(
        &self,
        guard: StartGuard<'_>,
        runtime: &tokio::runtime::Handle,
        token: TemporalToken,
        first_delay: Duration,
        period: Duration,
    ) {
        let token = Arc::new(token);
        self.current.send_replace(Some(Arc::clone(&token)));
        publish(&self.observers, &TokenChange::Started { current: token });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = RenewalTask {
            service: Arc::clone(&self.service),
            retry: Arc::clone(&self.retry),
            ttl_unit: self.ttl_unit,
            strict_refresh: self.strict_refresh,
            current: Arc::clone(&self.current),
            observers: Arc::clone(&self.observers),
        };
        let handle = task.spawn(runtime, first_delay, period, shutdown_rx);
        guard.complete(Job::Active { handle, shutdown });
    }

    /// Fetch the first token and start renewing it.
    ///
    /// The first renewal tick runs immediately, then every
    /// `round(expires_in * schedule)` units.
    pub async fn start(&self) -> Result<()> {
        let guard = self.begin()?;

        let credential = self
            .service
            .fetch()
            .await?
            .ok_or_else(|| Error::IllegalState("token service returned no token".into()))?;
        let token = TemporalToken::new(credential, SystemTime::now(), self.ttl_unit)?;
        let period = self.renewal_period(&token)?;

        info!(
            expires_in = token.credential().expires_in,
            ttl_unit = %self.ttl_unit,
            period_ms = period.as_millis() as u64,
            "token provider started"
        );
        self.activate(guard, &tokio::runtime::Handle::current(), token, Duration::ZERO, period);
        Ok(())
    }

    /// Start from a previously obtained credential instead of fetching.
    ///
    /// The first tick runs when the credential expires, then on the regular
    /// period. An expired credential is renewed right away if
    /// `refetch_if_expired` is set, and rejected otherwise. Must be called
    /// from within a tokio runtime.
    pub fn resume(
        &self,
        credential: Credential,
        fetched_at: SystemTime,
        refetch_if_expired: bool,
    ) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::IllegalState("resume requires a tokio runtime".into()))?;
        let guard = self.begin()?;

        let token = TemporalToken::new(credential, fetched_at, self.ttl_unit)?;
        if token.is_expired() && !refetch_if_expired {
            return Err(Error::IllegalState("cannot resume an expired token".into()));
        }
        let period = self.renewal_period(&token)?;
        let first_delay = token.ttl_left();

        info!(
            expired = token.is_expired(),
            first_delay_ms = first_delay.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "token provider resumed"
        );
        self.activate(guard, &runtime, token, first_delay, period);
        Ok(())
    }

    /// Stop renewing.
    ///
    /// Graceful: a tick in progress, retry waits included, completes first.
    /// Otherwise the task is aborted at its next suspension point, which is
    /// also what happens if a graceful stop is dropped before completing.
    /// Does nothing unless the provider is active.
    pub async fn stop(&self, graceful: bool) {
        let (handle, shutdown) = {
            let mut job = lock(&self.job);
            if !matches!(*job, Job::Active { .. }) {
                return;
            }
            match std::mem::replace(&mut *job, Job::Stopped) {
                Job::Active { handle, shutdown } => (handle, shutdown),
                _ => return,
            }
        };

        if graceful {
            let _ = shutdown.send(true);
            let mut task = AbortOnDrop(handle);
            if let Err(e) = (&mut task.0).await {
                warn!(error = %e, "renewal task ended abnormally");
            }
        } else {
            handle.abort();
            let _ = handle.await;
        }
        info!(graceful, "token provider stopped");
    }
}

impl fmt::Debug for AutoRenewingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoRenewingProvider")
            .field("state", &self.state())
            .field("retry", &self.retry)
            .field("ttl_unit", &self.ttl_unit)
            .field("strict_refresh", &self.strict_refresh)
            .field("schedule", &self.fraction())
            .finish_non_exhaustive()
    }
}
