//! Agent state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Agent lifecycle states.
#[derive(Debug)]
pub enum AgentState {
    /// Loading config, setting up resources
    Initializing,
    /// Fetching the first token
    StartingProvider {
        retries: u32,
        listen_addr: SocketAddr,
    },
    /// Waiting before the next start attempt
    Backoff {
        error: String,
        retries: u32,
        listen_addr: SocketAddr,
    },
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Serving tokens
    Running { listen_addr: SocketAddr },
    /// Finishing in-flight requests, then stopping the provider
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
}

/// Events that drive state transitions.
#[derive(Debug)]
pub enum AgentEvent {
    /// Configuration parsed successfully
    ConfigLoaded { listen_addr: SocketAddr },
    /// First token obtained, renewal running
    ProviderStarted,
    /// First token could not be obtained
    ProviderFailed(String),
    /// Backoff expired
    RetryTimer,
    /// HTTP listener bound and ready
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// HTTP server finished draining
    Drained,
    /// Drain deadline exceeded
    DrainTimeout,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum AgentAction {
    /// Start the token provider
    StartProvider,
    /// Set retry timer
    ScheduleRetry { delay: Duration },
    /// Bind HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Stop accepting requests and drain in-flight ones
    BeginDrain,
    /// Stop the provider's renewal task
    StopProvider { graceful: bool },
    /// Exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Start attempts before giving up
pub const MAX_START_RETRIES: u32 = 5;

/// Drain timeout duration
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for a graceful provider stop before it is aborted
pub const PROVIDER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: AgentState, event: AgentEvent) -> (AgentState, AgentAction) {
    match (state, event) {
        // --- Initializing ---
        (AgentState::Initializing, AgentEvent::ConfigLoaded { listen_addr }) => (
            AgentState::StartingProvider {
                retries: 0,
                listen_addr,
            },
            AgentAction::StartProvider,
        ),

        // --- StartingProvider ---
        (AgentState::StartingProvider { listen_addr, .. }, AgentEvent::ProviderStarted) => (
            AgentState::Starting { listen_addr },
            AgentAction::StartListener { addr: listen_addr },
        ),

        (
            AgentState::StartingProvider {
                retries,
                listen_addr,
            },
            AgentEvent::ProviderFailed(error),
        ) if retries < MAX_START_RETRIES => (
            AgentState::Backoff {
                error,
                retries,
                listen_addr,
            },
            AgentAction::ScheduleRetry {
                delay: Duration::from_secs(2u64.pow(retries)),
            },
        ),

        (AgentState::StartingProvider { .. }, AgentEvent::ProviderFailed(_)) => (
            AgentState::Stopped { exit_code: 1 },
            AgentAction::Shutdown { exit_code: 1 },
        ),

        // --- Backoff ---
        (
            AgentState::Backoff {
                retries,
                listen_addr,
                ..
            },
            AgentEvent::RetryTimer,
        ) => (
            AgentState::StartingProvider {
                retries: retries + 1,
                listen_addr,
            },
            AgentAction::StartProvider,
        ),

        // --- Starting ---
        (AgentState::Starting { listen_addr }, AgentEvent::ListenerReady) => {
            (AgentState::Running { listen_addr }, AgentAction::None)
        }

        // --- Running ---
        (AgentState::Running { .. }, AgentEvent::ShutdownSignal) => (
            AgentState::Draining {
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            AgentAction::BeginDrain,
        ),

        // --- Draining ---
        (AgentState::Draining { .. }, AgentEvent::Drained) => (
            AgentState::Stopped { exit_code: 0 },
            AgentAction::StopProvider { graceful: true },
        ),

        (AgentState::Draining { .. }, AgentEvent::DrainTimeout) => (
            AgentState::Stopped { exit_code: 0 },
            AgentAction::StopProvider { graceful: false },
        ),

        // --- Any other state + shutdown = stop ---
        (AgentState::Stopped { exit_code }, AgentEvent::ShutdownSignal) => (
            AgentState::Stopped { exit_code },
            AgentAction::None,
        ),

        (_, AgentEvent::ShutdownSignal) => (
            AgentState::Stopped { exit_code: 0 },
            AgentAction::StopProvider { graceful: false },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, AgentAction::None),
    }
}
