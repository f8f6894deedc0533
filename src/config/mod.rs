//! Typed configuration.
//!
//! [`Config`] comes from environment variables: secrets and endpoints,
//! loaded once at startup, failing fast when required ones are missing.
//! [`Settings`] is pipeline tuning read from an optional TOML file; every
//! field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::engine::WorkerConfig;
use crate::error::{Error, Result};
use crate::queue::{Durability, QueueConfig};

/// Longest lease a worker may take: one day.
const MAX_LEASE_SECS: u64 = 86_400;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub bind_addr: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            bind_addr: std::env::var("TALLY_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().filter(|s| !s.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Pipeline settings (TOML)
// ---------------------------------------------------------------------------

/// Pipeline tuning.
///
/// ```toml
/// [queue]
/// path = "tally-queue.db"
/// retry_limit = 5
///
/// [workers]
/// count = 8
/// lease_secs = 30
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub queue: QueueSettings,
    pub workers: WorkerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    /// SQLite file backing the durable queue.
    pub path: PathBuf,
    pub retry_limit: u32,
    pub durability: Durability,
    pub retry_backoff_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tally-queue.db"),
            retry_limit: 5,
            durability: Durability::Full,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub count: usize,
    pub lease_secs: u64,
    pub storage_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub poll_min_ms: u64,
    pub poll_max_ms: u64,
    /// Remove Done items this long after completion. 0 keeps them.
    pub done_retention_secs: u64,
    pub max_db_connections: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 4,
            lease_secs: 30,
            storage_timeout_secs: 10,
            sweep_interval_secs: 5,
            poll_min_ms: 50,
            poll_max_ms: 2000,
            done_retention_secs: 3600,
            max_db_connections: 10,
        }
    }
}

impl Settings {
    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read settings {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    /// Settings from `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse and validate settings from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let w = &self.workers;
        if self.queue.retry_limit == 0 {
            return Err(Error::Config("queue.retry_limit must be at least 1".into()));
        }
        if w.count == 0 {
            return Err(Error::Config("workers.count must be at least 1".into()));
        }
        if w.lease_secs == 0 || w.lease_secs > MAX_LEASE_SECS {
            return Err(Error::Config(format!(
                "workers.lease_secs must be between 1 and {MAX_LEASE_SECS}, got {}",
                w.lease_secs
            )));
        }
        // A storage call that outlives its lease lets a second worker
        // deliver the same item concurrently.
        if w.storage_timeout_secs >= w.lease_secs {
            return Err(Error::Config(format!(
                "workers.storage_timeout_secs ({}) must be shorter than workers.lease_secs ({})",
                w.storage_timeout_secs, w.lease_secs
            )));
        }
        if w.poll_min_ms == 0 || w.poll_min_ms > w.poll_max_ms {
            return Err(Error::Config(
                "workers.poll_min_ms must be positive and not above workers.poll_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retry_limit: self.queue.retry_limit,
            durability: self.queue.durability,
            retry_backoff: Duration::from_millis(self.queue.retry_backoff_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let w = &self.workers;
        WorkerConfig {
            workers: w.count,
            lease_duration: Duration::from_secs(w.lease_secs),
            storage_timeout: Duration::from_secs(w.storage_timeout_secs),
            sweep_interval: Duration::from_secs(w.sweep_interval_secs.max(1)),
            poll_min: Duration::from_millis(w.poll_min_ms),
            poll_max: Duration::from_millis(w.poll_max_ms),
            done_retention: (w.done_retention_secs > 0)
                .then(|| Duration::from_secs(w.done_retention_secs)),
        }
    }
}
