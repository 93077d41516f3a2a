use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config value: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Cadences, bounds and timeouts for one view session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub snapshot_interval_ms: u64,
    pub delta_interval_ms: u64,
    pub files_poll_ms: u64,
    pub files_min_interval_ms: u64,
    pub citations_min_interval_ms: u64,
    pub history_limit: u32,
    pub delta_limit: u32,
    pub max_delta_pages_per_tick: u32,
    pub detail_log_cap: usize,
    pub late_fill_window: u64,
    pub health_throttle_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub history_timeout_ms: u64,
    pub delta_timeout_ms: u64,
    pub files_timeout_ms: u64,
    pub citations_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub delete_timeout_ms: u64,
    pub delete_attempts: u32,
    pub delete_backoff_base_ms: u64,
    pub push_enabled: bool,
    pub push_backoff_initial_ms: u64,
    pub push_backoff_max_ms: u64,
    pub tick_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 2_000,
            delta_interval_ms: 1_500,
            files_poll_ms: 4_000,
            files_min_interval_ms: 8_000,
            citations_min_interval_ms: 30_000,
            history_limit: 200,
            delta_limit: 200,
            max_delta_pages_per_tick: 5,
            detail_log_cap: 40,
            late_fill_window: 1_024,
            health_throttle_ms: 2_500,
            snapshot_timeout_ms: 8_000,
            history_timeout_ms: 8_000,
            delta_timeout_ms: 8_000,
            files_timeout_ms: 20_000,
            citations_timeout_ms: 20_000,
            command_timeout_ms: 15_000,
            delete_timeout_ms: 60_000,
            delete_attempts: 4,
            delete_backoff_base_ms: 500,
            push_enabled: true,
            push_backoff_initial_ms: 1_000,
            push_backoff_max_ms: 10_000,
            tick_ms: 250,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("snapshot_interval_ms", self.snapshot_interval_ms),
            ("delta_interval_ms", self.delta_interval_ms),
            ("files_poll_ms", self.files_poll_ms),
            ("tick_ms", self.tick_ms),
            ("push_backoff_initial_ms", self.push_backoff_initial_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.history_limit == 0 || self.delta_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "history_limit/delta_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.detail_log_cap == 0 {
            return Err(ConfigError::Invalid {
                field: "detail_log_cap",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.delete_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "delete_attempts",
                reason: "must allow at least one attempt".to_string(),
            });
        }
        if self.push_backoff_max_ms < self.push_backoff_initial_ms {
            return Err(ConfigError::Invalid {
                field: "push_backoff_max_ms",
                reason: "must not be below push_backoff_initial_ms".to_string(),
            });
        }
        Ok(())
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn delta_interval(&self) -> Duration {
        Duration::from_millis(self.delta_interval_ms)
    }

    pub fn files_poll(&self) -> Duration {
        Duration::from_millis(self.files_poll_ms)
    }

    pub fn files_min_interval(&self) -> Duration {
        Duration::from_millis(self.files_min_interval_ms)
    }

    pub fn citations_min_interval(&self) -> Duration {
        Duration::from_millis(self.citations_min_interval_ms)
    }

    pub fn health_throttle(&self) -> Duration {
        Duration::from_millis(self.health_throttle_ms)
    }

    pub fn delete_backoff_base(&self) -> Duration {
        Duration::from_millis(self.delete_backoff_base_ms)
    }

    pub fn push_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.push_backoff_initial_ms)
    }

    pub fn push_backoff_max(&self) -> Duration {
        Duration::from_millis(self.push_backoff_max_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

pub fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
