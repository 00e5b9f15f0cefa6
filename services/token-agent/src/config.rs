//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from the TOKEN_AGENT_CLIENT_SECRET env var or
//! client_secret_file, never stored in the TOML directly to avoid leaking it.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use token_provider::{AutoRenewingProvider, FixedRetry, MinimalRetry, NoRetry, TtlUnit};
use token_service::GrantRequest;

pub const CLIENT_SECRET_ENV: &str = "TOKEN_AGENT_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub token_service: TokenServiceConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Authorization server settings
#[derive(Debug, Deserialize)]
pub struct TokenServiceConfig {
    pub base_url: String,
    #[serde(default = "default_path")]
    pub path: String,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to the env var)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Send client credentials with HTTP basic auth instead of form fields
    #[serde(default)]
    pub basic_auth: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// When and how tokens are renewed
#[derive(Debug, Deserialize)]
pub struct RenewalConfig {
    #[serde(default = "default_schedule")]
    pub schedule: f64,
    #[serde(default)]
    pub ttl_unit: TtlUnit,
    #[serde(default)]
    pub strict_refresh: bool,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            ttl_unit: TtlUnit::default(),
            strict_refresh: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    None,
    #[default]
    Minimal,
    Fixed,
}

/// Retry policy for failed renewals
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub policy: RetryKind,
    /// Attempts per renewal, `fixed` policy only
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between attempts, `fixed` policy only
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryKind::default(),
            max_retries: default_max_retries(),
            period_secs: default_period_secs(),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_path() -> String {
    token_service::DEFAULT_TOKEN_PATH.to_string()
}

fn default_grant_type() -> String {
    token_service::grant::CLIENT_CREDENTIALS.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_schedule() -> f64 {
    token_provider::DEFAULT_SCHEDULE
}

fn default_max_retries() -> u32 {
    MinimalRetry::MAX_RETRIES
}

fn default_period_secs() -> u64 {
    MinimalRetry::PERIOD.as_secs()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8089))
}

fn default_max_connections() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. TOKEN_AGENT_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        let service = &mut config.token_service;
        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            service.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = service.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                service.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let service = &self.token_service;
        if !service.base_url.starts_with("http://") && !service.base_url.starts_with("https://") {
            return Err(common::Error::invalid_field(
                "token_service.base_url",
                format!("must start with http:// or https://, got: {}", service.base_url),
            ));
        }
        if service.client_id.trim().is_empty() {
            return Err(common::Error::invalid_field(
                "token_service.client_id",
                "must not be empty",
            ));
        }
        if service.timeout_secs == 0 {
            return Err(common::Error::invalid_field(
                "token_service.timeout_secs",
                "must be greater than 0",
            ));
        }

        let schedule = self.renewal.schedule;
        if !(schedule > 0.0 && schedule <= 1.0) {
            return Err(common::Error::invalid_field(
                "renewal.schedule",
                format!("must be in (0, 1], got {schedule}"),
            ));
        }

        if self.retry.policy == RetryKind::Fixed && self.retry.max_retries == 0 {
            return Err(common::Error::invalid_field(
                "retry.max_retries",
                "must be greater than 0",
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::invalid_field(
                "server.max_connections",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-agent.toml")
    }
}

impl TokenServiceConfig {
    /// Grant posted to obtain new tokens.
    pub fn grant(&self) -> GrantRequest {
        let mut grant = GrantRequest::new(self.grant_type.clone(), self.client_id.clone())
            .with_scopes(self.scopes.iter().cloned());
        if let Some(secret) = &self.client_secret {
            grant = grant.with_client_secret(secret.clone());
        }
        grant
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RetryConfig {
    /// Install the configured policy on `provider`.
    pub fn apply(&self, provider: AutoRenewingProvider) -> AutoRenewingProvider {
        match self.policy {
            RetryKind::None => provider.with_retry_policy(NoRetry),
            RetryKind::Minimal => provider.with_retry_policy(MinimalRetry),
            RetryKind::Fixed => provider.with_retry_policy(FixedRetry::new(
                self.max_retries,
                Duration::from_secs(self.period_secs),
            )),
        }
    }
}
