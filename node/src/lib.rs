use serde::{Deserialize, Serialize};
use spinwallet_execution::{EngineConfig, LedgerConfig, PaymentConfig};
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;

pub mod service;
pub mod sqlite;
pub mod telemetry;

pub use service::Service;
pub use sqlite::SqliteState;

pub const DEFAULT_MAX_SPINS: u32 = spinwallet_types::api::DEFAULT_MAX_SPINS;
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 8;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5;
pub const DEFAULT_PAYMENT_INITIATION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PAYMENT_EXPIRY_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 60;

/// Configuration for the wallet daemon, read from YAML.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub database_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_max_spins")]
    pub max_spins: u32,
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_payment_initiation_timeout_ms")]
    pub payment_initiation_timeout_ms: u64,
    #[serde(default = "default_payment_expiry_secs")]
    pub payment_expiry_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    #[serde(default = "default_seed_default_algorithms")]
    pub seed_default_algorithms: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

pub struct ValidatedConfig {
    pub database_path: PathBuf,
    pub log_level: Level,
    pub engine: EngineConfig,
    pub sweep_interval: Duration,
    pub scheduler_interval: Duration,
    pub seed_default_algorithms: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_spins() -> u32 {
    DEFAULT_MAX_SPINS
}

fn default_max_commit_attempts() -> u32 {
    DEFAULT_MAX_COMMIT_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_payment_initiation_timeout_ms() -> u64 {
    DEFAULT_PAYMENT_INITIATION_TIMEOUT_MS
}

fn default_payment_expiry_secs() -> u64 {
    DEFAULT_PAYMENT_EXPIRY_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_scheduler_interval_secs() -> u64 {
    DEFAULT_SCHEDULER_INTERVAL_SECS
}

fn default_seed_default_algorithms() -> bool {
    true
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

impl Config {
    /// Defaults for everything but the database location.
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            log_level: default_log_level(),
            max_spins: DEFAULT_MAX_SPINS,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            payment_initiation_timeout_ms: DEFAULT_PAYMENT_INITIATION_TIMEOUT_MS,
            payment_expiry_secs: DEFAULT_PAYMENT_EXPIRY_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            scheduler_interval_secs: DEFAULT_SCHEDULER_INTERVAL_SECS,
            seed_default_algorithms: true,
        }
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "database_path",
            });
        }
        ensure_nonzero("max_spins", u64::from(self.max_spins))?;
        ensure_nonzero("max_commit_attempts", u64::from(self.max_commit_attempts))?;
        ensure_nonzero(
            "payment_initiation_timeout_ms",
            self.payment_initiation_timeout_ms,
        )?;
        ensure_nonzero("payment_expiry_secs", self.payment_expiry_secs)?;
        ensure_nonzero("sweep_interval_secs", self.sweep_interval_secs)?;
        ensure_nonzero("scheduler_interval_secs", self.scheduler_interval_secs)?;

        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        let engine = EngineConfig {
            max_spins: self.max_spins,
            ledger: LedgerConfig {
                max_attempts: self.max_commit_attempts,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            payments: PaymentConfig {
                initiation_timeout: Duration::from_millis(self.payment_initiation_timeout_ms),
                expiry: Duration::from_secs(self.payment_expiry_secs),
                max_attempts: self.max_commit_attempts,
            },
        };

        Ok(ValidatedConfig {
            database_path: PathBuf::from(self.database_path),
            log_level,
            engine,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            scheduler_interval: Duration::from_secs(self.scheduler_interval_secs),
            seed_default_algorithms: self.seed_default_algorithms,
        })
    }
}
