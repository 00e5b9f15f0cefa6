//! Token Agent
//!
//! Sidecar daemon that:
//! 1. Obtains an OAuth access token from the configured authorization server
//! 2. Keeps it renewed in the background before it expires
//! 3. Serves the current token to local clients on `/token`

mod config;
mod metrics;
mod service;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use token_provider::AutoRenewingProvider;
use token_service::{HttpTokenEndpoint, TokenServiceDelegate};

use crate::config::Config;
use crate::service::{AgentAction, AgentEvent, AgentState, PROVIDER_STOP_TIMEOUT, handle_event};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    provider: Arc<AutoRenewingProvider>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/token", get(token_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Wire the HTTP endpoint, delegate and provider from config.
fn build_provider(config: &Config) -> Result<AutoRenewingProvider> {
    let service_config = &config.token_service;
    let client = reqwest::Client::builder()
        .timeout(service_config.timeout())
        .build()
        .context("failed to build HTTP client")?;

    let endpoint = HttpTokenEndpoint::new(client, service_config.base_url.clone())
        .with_basic_auth(service_config.basic_auth);
    let delegate = TokenServiceDelegate::new(endpoint, service_config.grant())
        .with_path(service_config.path.clone());

    let provider = AutoRenewingProvider::new(Arc::new(delegate))
        .with_ttl_unit(config.renewal.ttl_unit)
        .with_strict_refresh(config.renewal.strict_refresh);
    let provider = config.retry.apply(provider);
    provider
        .schedule(config.renewal.schedule)
        .context("invalid renewal schedule")?;
    provider.attach(metrics::observer());
    Ok(provider)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-agent");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // --- State: Initializing ---
    let state = AgentState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.token_service.base_url,
        client_id = %config.token_service.client_id,
        grant_type = %config.token_service.grant_type,
        listen_addr = %config.server.listen_addr,
        retry_policy = ?config.retry.policy,
        "configuration loaded"
    );

    let provider = Arc::new(build_provider(&config)?);

    // Transition: Initializing -> StartingProvider
    let (mut state, mut action) = handle_event(
        state,
        AgentEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
        },
    );

    // Obtain the first token, retrying with backoff per the state machine
    let (state, action) =
        start_with_backoff(&provider, state, action, shutdown_signal()).await?;
    let listen_addr = match action {
        AgentAction::StartListener { addr } => addr,
        AgentAction::Shutdown { exit_code } => {
            error!("initial token fetch failed after max retries");
            std::process::exit(exit_code);
        }
        AgentAction::StopProvider { graceful } => {
            stop_provider(&provider, graceful).await;
            info!("shutdown before first token");
            return Ok(());
        }
        other => anyhow::bail!("unexpected action while starting: {other:?}"),
    };

    let app_state = AppState {
        provider: Arc::clone(&provider),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Transition: Starting -> Running
    let (state, _action) = handle_event(state, AgentEvent::ListenerReady);
    info!(addr = %listen_addr, "state: Running, serving tokens");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Wait for the OS signal
    shutdown_signal().await;

    // Transition: Running -> Draining
    let (state, _action) = handle_event(state, AgentEvent::ShutdownSignal);
    let AgentState::Draining { deadline } = state else {
        anyhow::bail!("unexpected state after shutdown signal: {state:?}");
    };
    let _ = shutdown_tx.send(());

    // The drain deadline starts at signal receipt
    let drained = tokio::time::timeout_at(deadline.into(), server_handle).await;
    let event = match drained {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            AgentEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            AgentEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            AgentEvent::Drained
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = service::DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            AgentEvent::DrainTimeout
        }
    };

    // Transition: Draining -> Stopped
    let (_state, action) = handle_event(state, event);
    if let AgentAction::StopProvider { graceful } = action {
        stop_provider(&provider, graceful).await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Drive the startup half of the state machine until it asks to bind the
/// listener, stop, or exit. A `shutdown` during a backoff wait ends the
/// wait immediately.
async fn start_with_backoff(
    provider: &AutoRenewingProvider,
    mut state: AgentState,
    mut action: AgentAction,
    shutdown: impl Future<Output = ()>,
) -> Result<(AgentState, AgentAction)> {
    tokio::pin!(shutdown);
    loop {
        match action {
            AgentAction::StartProvider => match provider.start().await {
                Ok(()) => (state, action) = handle_event(state, AgentEvent::ProviderStarted),
                Err(e) => {
                    (state, action) =
                        handle_event(state, AgentEvent::ProviderFailed(e.to_string()))
                }
            },
            AgentAction::ScheduleRetry { delay } => {
                if let AgentState::Backoff { error, retries, .. } = &state {
                    warn!(
                        error = %error,
                        retries,
                        retry_in_secs = delay.as_secs(),
                        "initial token fetch failed, retrying"
                    );
                }
                let event = tokio::select! {
                    _ = tokio::time::sleep(delay) => AgentEvent::RetryTimer,
                    _ = &mut shutdown => AgentEvent::ShutdownSignal,
                };
                (state, action) = handle_event(state, event);
            }
            AgentAction::StartListener { .. }
            | AgentAction::Shutdown { .. }
            | AgentAction::StopProvider { .. } => return Ok((state, action)),
            other => anyhow::bail!("unexpected action while starting: {other:?}"),
        }
    }
}

/// Stop renewal. A graceful stop that outlives `PROVIDER_STOP_TIMEOUT` is
/// dropped, and dropping it aborts the renewal task.
async fn stop_provider(provider: &AutoRenewingProvider, graceful: bool) {
    if !graceful {
        provider.stop(false).await;
        return;
    }
    if tokio::time::timeout(PROVIDER_STOP_TIMEOUT, provider.stop(true))
        .await
        .is_err()
    {
        warn!(
            timeout_secs = PROVIDER_STOP_TIMEOUT.as_secs(),
            "graceful provider stop timed out, dropped stop aborted the renewal task"
        );
    }
}

/// Current access token as JSON, or 503 when no valid token is held.
///
/// `expires_in` is the number of whole seconds the token remains valid.
async fn token_handler(State(state): State<AppState>) -> impl IntoResponse {
    let token = state
        .provider
        .current_token()
        .filter(|token| !token.is_expired());

    let (status_code, body) = match token {
        Some(token) => {
            let credential = token.credential();
            (
                StatusCode::OK,
                serde_json::json!({
                    "access_token": credential.access_token(),
                    "token_type": credential.token_type,
                    "expires_in": token.ttl_left().as_secs(),
                }),
            )
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "error": "no_valid_token",
                "provider": state.provider.state().to_string(),
            }),
        ),
    };

    (
        status_code,
        [
            (axum::http::header::CONTENT_TYPE, "application/json"),
            (axum::http::header::CACHE_CONTROL, "no-store"),
        ],
        body.to_string(),
    )
}

/// Health endpoint: 200 when a valid token is held, 503 when degraded.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let token = state.provider.current_token();
    let ttl_left = token.as_ref().map(|t| t.ttl_left().as_secs());
    let healthy = state.provider.is_active() && token.is_some_and(|t| !t.is_expired());

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "provider": state.provider.state().to_string(),
        "token_ttl_seconds": ttl_left,
        "uptime_seconds": uptime,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(token) = state.provider.current_token() {
        metrics::record_token_ttl(&token);
    }
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
