//! Tunables for the lifecycle service, loaded from YAML and environment.

use serde::Deserialize;
use std::time::Duration;

/// Lifecycle configuration. Every field has a default, so an empty document
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleConfig {
    /// Upper bound for `wait_for_ready` when the caller gives none.
    pub ready_timeout_ms: u64,
    /// Upper bound for `wait_for_synced`; unbounded when absent.
    pub sync_timeout_ms: Option<u64>,
    /// How long `duplicate` waits for the source to finish syncing.
    pub duplicate_sync_timeout_ms: u64,
    /// Coalescing window for `updatedDate` writes.
    pub updated_date_throttle_ms: u64,
    /// Priority weight registered while a document is open.
    pub open_priority: i32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 10_000,
            sync_timeout_ms: None,
            duplicate_sync_timeout_ms: 30_000,
            updated_date_throttle_ms: 1_000,
            open_priority: 10,
        }
    }
}

impl LifecycleConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(ConfigError::Parse)
    }

    /// Apply overrides from environment variables.
    ///
    /// Recognized variables:
    /// - `DOC_READY_TIMEOUT_MS`
    /// - `DOC_UPDATED_THROTTLE_MS`
    /// - `DOC_OPEN_PRIORITY`
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("DOC_READY_TIMEOUT_MS") {
            self.ready_timeout_ms = parse_var("DOC_READY_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("DOC_UPDATED_THROTTLE_MS") {
            self.updated_date_throttle_ms = parse_var("DOC_UPDATED_THROTTLE_MS", &value)?;
        }
        if let Some(value) = lookup("DOC_OPEN_PRIORITY") {
            self.open_priority = parse_var("DOC_OPEN_PRIORITY", &value)?;
        }
        Ok(self)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }

    pub fn duplicate_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.duplicate_sync_timeout_ms)
    }

    pub fn updated_date_throttle(&self) -> Duration {
        Duration::from_millis(self.updated_date_throttle_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        name,
        value: value.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },
}
