//! Service configuration.
//!
//! Configuration is plain data deserialized with serde. Durations use
//! humantime notation (`"25s"`, `"500ms"`) so that JSON fixtures and
//! environment overrides stay readable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default timeout for a single transport round-trip (the D-Bus default).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Default bound on item constructions running at once in one reconciliation.
pub const DEFAULT_ITEM_LOAD_CONCURRENCY: usize = 32;

/// Default capacity of each collection's observer channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Environment variable overriding [`ServiceConfig::call_timeout`].
pub const CALL_TIMEOUT_ENV: &str = "SECRET_SERVICE_CALL_TIMEOUT";

/// Tunables for a [`Service`](crate::service::Service) and the collections
/// created through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Upper bound for every async transport call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Maximum number of item constructions in flight per reconciliation pass.
    pub item_load_concurrency: usize,
    /// Capacity of the per-collection event channel.
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            item_load_concurrency: DEFAULT_ITEM_LOAD_CONCURRENCY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ServiceConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        let call_timeout = std::env::var(CALL_TIMEOUT_ENV).ok();
        self.with_call_timeout_override(call_timeout.as_deref())
    }

    /// Apply a raw humantime call timeout such as `"5s"`, if one is given.
    fn with_call_timeout_override(mut self, raw: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(raw) = raw {
            self.call_timeout =
                humantime_serde::re::humantime::parse_duration(raw).map_err(|e| {
                    ConfigError::Invalid {
                        field: "call_timeout",
                        reason: format!("{CALL_TIMEOUT_ENV}={raw}: {e}"),
                    }
                })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings that would stall every operation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "call_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.item_load_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "item_load_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
