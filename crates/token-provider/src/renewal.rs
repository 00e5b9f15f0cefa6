//! Background token renewal
//!
//! One task per provider renews the current token on a fixed delay: the
//! next tick is scheduled `period` after the previous tick finished. A tick
//! makes up to `max_retries` attempts. Nothing escapes a tick: failures are
//! logged and reported to observers, and the loop keeps going.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use token_service::{Error as ServiceError, TokenService};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::change::{TokenChange, TokenChangeObserver};
use crate::observable::Observable;
use crate::retry::RetryPolicy;
use crate::temporal::{TemporalToken, TtlUnit};

pub(crate) type CurrentToken = watch::Sender<Option<Arc<TemporalToken>>>;
pub(crate) type Observers = Observable<dyn TokenChangeObserver>;

/// Notify observers, logging instead of propagating observer failures.
///
/// A panicking observer ends the notification round like an error does and
/// never unwinds into the renewal task.
pub(crate) fn publish(observers: &Observers, change: &TokenChange) {
    let notified = panic::catch_unwind(AssertUnwindSafe(|| {
        observers.notify(|observer| observer.token_changed(change))
    }));
    match notified {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(kind = change.kind(), error = %e, "token change observer failed"),
        Err(payload) => error!(
            kind = change.kind(),
            panic = panic_message(payload.as_ref()),
            "token change observer panicked"
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Everything a tick needs, shared with the owning provider.
pub(crate) struct RenewalTask {
    pub(crate) service: Arc<dyn TokenService>,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) ttl_unit: TtlUnit,
    pub(crate) strict_refresh: bool,
    pub(crate) current: Arc<CurrentToken>,
    pub(crate) observers: Arc<Observers>,
}

impl RenewalTask {
    /// Spawn the fixed-delay loop on `runtime`.
    ///
    /// The loop ends when `shutdown` flips to `true` or its sender is
    /// dropped. A tick in progress, retry waits included, always completes.
    pub(crate) fn spawn(
        self,
        runtime: &tokio::runtime::Handle,
        first_delay: Duration,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        runtime.spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                self.tick().await;
                if *shutdown.borrow() {
                    break;
                }
                delay = period;
            }
            debug!("renewal loop finished");
        })
    }

    /// One renewal tick against the token current at the start of the tick.
    pub(crate) async fn tick(&self) {
        let snapshot = self.current.borrow().clone();
        let Some(token) = snapshot else {
            return;
        };

        let max_retries = self.retry.max_retries();
        let mut attempts = 0;
        while attempts < max_retries {
            attempts += 1;
            match self.renew(&token).await {
                Ok(Some(renewed)) => {
                    metrics::counter!("token_renewal_attempts_total", "outcome" => "renewed")
                        .increment(1);
                    metrics::counter!("token_renewal_ticks_total", "outcome" => "renewed")
                        .increment(1);
                    let renewed = Arc::new(renewed);
                    let previous = self
                        .current
                        .send_replace(Some(Arc::clone(&renewed)))
                        .unwrap_or_else(|| Arc::clone(&token));
                    info!(
                        attempt = attempts,
                        expires_in = renewed.credential().expires_in,
                        ttl_unit = %renewed.ttl_unit(),
                        "token renewed"
                    );
                    publish(
                        &self.observers,
                        &TokenChange::Renewed {
                            current: renewed,
                            previous,
                        },
                    );
                    return;
                }
                Ok(None) => {
                    metrics::counter!("token_renewal_attempts_total", "outcome" => "empty")
                        .increment(1);
                    warn!(attempt = attempts, max_retries, "token service returned no token");
                }
                Err(e) => {
                    metrics::counter!("token_renewal_attempts_total", "outcome" => "error")
                        .increment(1);
                    warn!(attempt = attempts, max_retries, error = %e, "token renewal attempt failed");
                    if !self.retry.on_error(&e) {
                        metrics::counter!("token_renewal_ticks_total", "outcome" => "vetoed")
                            .increment(1);
                        warn!(attempt = attempts, "retry policy declined, keeping current token");
                        return;
                    }
                    if attempts < max_retries {
                        let wait = self.retry.period_between_retries();
                        debug!(wait_ms = wait.as_millis() as u64, "waiting before next attempt");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        if attempts == 0 {
            return;
        }
        metrics::counter!("token_renewal_ticks_total", "outcome" => "exhausted").increment(1);
        error!(attempts, "token renewal exhausted its attempts, keeping last good token");
        publish(
            &self.observers,
            &TokenChange::RenewalFailed {
                last_good: token,
                attempts,
            },
        );
    }

    /// Obtain a replacement for `token`.
    ///
    /// Without a refresh token a new token is fetched (unless strict refresh
    /// forbids it). With one, or when fetching produced nothing, the
    /// refresh token is exchanged.
    async fn renew(&self, token: &TemporalToken) -> token_service::Result<Option<TemporalToken>> {
        let refresh_token = token.credential().refresh_token();

        let mut renewed = None;
        if refresh_token.is_none() {
            if self.strict_refresh {
                return Err(ServiceError::State(
                    "strict refresh is enabled but the token has no refresh token".into(),
                ));
            }
            renewed = self.service.fetch().await?;
        }
        if renewed.is_none() {
            if let Some(refresh_token) = refresh_token {
                renewed = self.service.refresh(refresh_token).await?;
            }
        }

        renewed
            .map(|credential| TemporalToken::new(credential, SystemTime::now(), self.ttl_unit))
            .transpose()
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ObserverError;
    use crate::retry::{FixedRetry, NoRetry};
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use token_service::{Credential, TokenFuture};

    /// Service that fails `failures` times, then issues a token.
    struct FlakyService {
        failures: usize,
        calls: AtomicUsize,
        refreshed_with: Mutex<Vec<String>>,
    }

    impl FlakyService {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                refreshed_with: Mutex::new(Vec::new()),
            }
        }

        fn next(&self) -> token_service::Result<Option<Credential>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ServiceError::Http("connection reset".into()))
            } else {
                Ok(Some(Credential::new(format!("at_{n}"), 300)))
            }
        }
    }

    impl TokenService for FlakyService {
        fn fetch(&self) -> TokenFuture<'_> {
            Box::pin(async move { self.next() })
        }

        fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
            Box::pin(async move {
                self.refreshed_with
                    .lock()
                    .unwrap()
                    .push(refresh_token.to_string());
                self.next()
            })
        }
    }

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    fn task(
        service: Arc<FlakyService>,
        retry: Arc<dyn RetryPolicy>,
        seed: Credential,
    ) -> (RenewalTask, Arc<Mutex<Vec<&'static str>>>) {
        let token = TemporalToken::with_default_unit(seed, SystemTime::now()).unwrap();
        let (current, _) = watch::channel(Some(Arc::new(token)));
        let observers: Arc<Observers> = Arc::new(Observable::new());
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        observers.attach(Arc::new(move |change: &TokenChange| {
            sink.lock().unwrap().push(change.kind());
            Ok::<(), ObserverError>(())
        }));

        let task = RenewalTask {
            service,
            retry,
            ttl_unit: TtlUnit::Seconds,
            strict_refresh: false,
            current: Arc::new(current),
            observers,
        };
        (task, kinds)
    }

    #[tokio::test(start_paused = true)]
    async fn tick_records_attempts_and_outcome() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let service = Arc::new(FlakyService::new(2));
        let retry = Arc::new(FixedRetry::new(3, Duration::from_secs(5)));
        let (task, kinds) = task(Arc::clone(&service), retry, Credential::new("seed", 300));

        task.tick().await;

        assert_eq!(*kinds.lock().unwrap(), vec!["renewed"]);
        let output = handle.render();
        assert!(
            output.contains("token_renewal_attempts_total{outcome=\"error\"} 2"),
            "{output}"
        );
        assert!(
            output.contains("token_renewal_attempts_total{outcome=\"renewed\"} 1"),
            "{output}"
        );
        assert!(
            output.contains("token_renewal_ticks_total{outcome=\"renewed\"} 1"),
            "{output}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_tick_keeps_token_and_reports_failure() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let service = Arc::new(FlakyService::new(10));
        let retry = Arc::new(FixedRetry::new(2, Duration::from_secs(5)));
        let (task, kinds) = task(Arc::clone(&service), retry, Credential::new("seed", 300));

        let begin = tokio::time::Instant::now();
        task.tick().await;

        // One wait between the two attempts, none after the last.
        let waited = begin.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(*kinds.lock().unwrap(), vec!["renewal_failed"]);
        let current = task.current.borrow().clone().unwrap();
        assert_eq!(current.credential().access_token(), "seed");
        assert!(
            handle
                .render()
                .contains("token_renewal_ticks_total{outcome=\"exhausted\"} 1")
        );
    }

    #[tokio::test]
    async fn vetoed_tick_publishes_nothing() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let service = Arc::new(FlakyService::new(1));
        let (task, kinds) = task(
            Arc::clone(&service),
            Arc::new(NoRetry),
            Credential::new("seed", 300),
        );

        task.tick().await;

        assert!(kinds.lock().unwrap().is_empty());
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert!(
            handle
                .render()
                .contains("token_renewal_ticks_total{outcome=\"vetoed\"} 1")
        );
    }

    #[tokio::test]
    async fn panicking_observer_does_not_unwind_into_tick() {
        let service = Arc::new(FlakyService::new(0));
        let (task, kinds) = task(
            Arc::clone(&service),
            Arc::new(NoRetry),
            Credential::new("seed", 300),
        );
        task.observers.attach(Arc::new(|_: &TokenChange| -> Result<(), ObserverError> {
            panic!("observer bug")
        }));

        task.tick().await;

        let current = task.current.borrow().clone().unwrap();
        assert_eq!(current.credential().access_token(), "at_0");
        assert_eq!(*kinds.lock().unwrap(), vec!["renewed"]);
    }

    #[tokio::test]
    async fn token_with_refresh_token_is_refreshed_not_fetched() {
        let service = Arc::new(FlakyService::new(0));
        let (task, kinds) = task(
            Arc::clone(&service),
            Arc::new(NoRetry),
            Credential::new("seed", 300).with_refresh_token("rt_seed"),
        );

        task.tick().await;

        assert_eq!(*service.refreshed_with.lock().unwrap(), vec!["rt_seed"]);
        assert_eq!(*kinds.lock().unwrap(), vec!["renewed"]);
    }

    #[tokio::test]
    async fn strict_refresh_without_refresh_token_fails_attempt() {
        let service = Arc::new(FlakyService::new(0));
        let (mut task, kinds) = task(
            Arc::clone(&service),
            Arc::new(NoRetry),
            Credential::new("seed", 300),
        );
        task.strict_refresh = true;

        let token = task.current.borrow().clone().unwrap();
        let err = task.renew(&token).await.unwrap_err();
        assert!(matches!(err, ServiceError::State(_)), "got: {err:?}");
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
        assert!(kinds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_credential_is_an_invalid_response() {
        struct NegativeTtl;
        impl TokenService for NegativeTtl {
            fn fetch(&self) -> TokenFuture<'_> {
                Box::pin(async { Ok(Some(Credential::new("bad", -30))) })
            }
            fn refresh<'a>(&'a self, _rt: &'a str) -> TokenFuture<'a> {
                Box::pin(async { Ok(None) })
            }
        }

        let (mut task, _) = task(
            Arc::new(FlakyService::new(0)),
            Arc::new(NoRetry),
            Credential::new("seed", 300),
        );
        task.service = Arc::new(NegativeTtl);

        let token = task.current.borrow().clone().unwrap();
        let err = task.renew(&token).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse(_)), "got: {err:?}");
    }
}
