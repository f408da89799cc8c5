//! Queue configuration, layered with figment.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. `./notiq.toml` (optional)
//! 3. `NOTIQ_*` environment variables (e.g. `NOTIQ_BATCH_SIZE=50`)

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::RunnerConfig;

/// Default configuration file, looked up in the working directory.
pub const CONFIG_FILE: &str = "notiq.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "NOTIQ_";

/// Longest accepted interval or timeout, in seconds (one year).
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Longest accepted retention, in days.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// Settings for the queue worker and the operator endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Items claimed per processing pass.
    pub batch_size: usize,
    /// Seconds between processing passes.
    pub poll_interval_secs: u64,
    /// Upper bound on a single channel dispatch.
    pub dispatch_timeout_secs: u64,
    /// Seconds between cleanup runs.
    pub cleanup_interval_secs: u64,
    /// Terminal items older than this many days are deleted.
    pub retention_days: u32,
    /// Claims not renewed for this many seconds are returned to `retry`.
    /// Must exceed twice `dispatch_timeout_secs`, since a worker renews its
    /// claim right before each dispatch.
    pub stale_claim_secs: u64,
    /// Postgres URL. Without one the in-memory store is used.
    pub database_url: Option<String>,
    /// Bind address of the operator HTTP endpoint.
    pub http_addr: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_secs: 300,
            dispatch_timeout_secs: 30,
            cleanup_interval_secs: 86_400,
            retention_days: 30,
            stale_claim_secs: 900,
            database_url: None,
            http_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl QueueConfig {
    /// Load from defaults, `./notiq.toml` and `NOTIQ_*` variables, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::figment(Toml::file(CONFIG_FILE)).extract::<Self>()?.validated()
    }

    /// Like [`load`](Self::load), reading the file at `path` instead.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::figment(Toml::file(path)).extract::<Self>()?.validated()
    }

    /// Parse TOML on top of the defaults, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract::<Self>()?
            .validated()
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("batch_size", self.batch_size == 0),
            ("poll_interval_secs", self.poll_interval_secs == 0),
            ("dispatch_timeout_secs", self.dispatch_timeout_secs == 0),
            ("cleanup_interval_secs", self.cleanup_interval_secs == 0),
            ("retention_days", self.retention_days == 0),
            ("stale_claim_secs", self.stale_claim_secs == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }

        let intervals = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("dispatch_timeout_secs", self.dispatch_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("stale_claim_secs", self.stale_claim_secs),
        ];
        if let Some((field, _)) = intervals
            .iter()
            .find(|(_, secs)| *secs > MAX_INTERVAL_SECS)
        {
            return Err(ConfigError::Invalid(format!(
                "{field} must be at most {MAX_INTERVAL_SECS}"
            )));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Invalid(format!(
                "retention_days must be at most {MAX_RETENTION_DAYS}"
            )));
        }
        if self.stale_claim_secs <= self.dispatch_timeout_secs.saturating_mul(2) {
            return Err(ConfigError::Invalid(format!(
                "stale_claim_secs ({}) must exceed twice dispatch_timeout_secs ({})",
                self.stale_claim_secs, self.dispatch_timeout_secs
            )));
        }

        if self.http_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("http_addr must not be empty".to_string()));
        }
        if self
            .database_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "database_url must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    /// Runner settings derived from this configuration.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            batch_size: self.batch_size,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            retention_days: self.retention_days,
            stale_after: self.stale_after(),
            ..RunnerConfig::default()
        }
    }
}
