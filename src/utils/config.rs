// src/utils/config.rs
//! Engine configuration
//!
//! Loads from an optional `warden.toml` plus `WARDEN_`-prefixed environment
//! variables (e.g. `WARDEN_SCHEDULER__POLL_INTERVAL_MS=1000`).

use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Scheduler settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Poll interval for the job loop (milliseconds)
    pub poll_interval_ms: u64,

    /// Retry ceiling applied when a job specifies none
    pub default_max_attempts: u32,

    /// Delay before a failed job is retried (minutes)
    pub retry_delay_mins: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            default_max_attempts: 5,
            retry_delay_mins: 15,
        }
    }
}

/// Storage settings for the SQLite-backed log
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base directory for persistent state
    pub base_dir: PathBuf,

    /// SQLite database file name
    pub db_name: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("~/.warden"),
            db_name: "log.db".to_string(),
        }
    }
}

/// Outbound fetch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Request timeout (seconds)
    pub timeout_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub fetch: FetchSettings,
}

impl EngineConfig {
    /// Load configuration from `warden.toml` (if present) and environment.
    pub fn load() -> Result<Self> {
        Self::load_from("warden.toml")
    }

    /// Load configuration from a specific file path and environment.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()
            .map_err(|e| EngineError::ConfigError(format!("Failed to load config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| EngineError::ConfigError(format!("Invalid config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.poll_interval_ms, 5000);
        assert_eq!(config.scheduler.default_max_attempts, 5);
        assert_eq!(config.scheduler.retry_delay_mins, 15);
        assert_eq!(config.fetch.timeout_secs, 30);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = EngineConfig::load_from("does-not-exist").unwrap();
        assert_eq!(config.scheduler.default_max_attempts, 5);
        assert_eq!(config.storage.db_name, "log.db");
    }
}
