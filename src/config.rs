//! Configuration for arbitration, pending snoozes, the activation slot and
//! the offline mutation queue.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendConfig {
    /// Switch arbitration and snooze defaults.
    pub arbitration: ArbitrationConfig,
    /// Activation slot timer settings.
    pub slot: SlotConfig,
    /// Offline mutation queue retry policy.
    pub queue: QueueConfig,
    /// Durable storage location.
    pub storage: StorageConfig,
}

/// Switch arbitration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Seconds to wait for a switch decision before defaulting to snooze.
    pub decision_timeout_secs: u64,
    /// Default snooze duration in seconds when no per-task preference exists.
    pub default_snooze_secs: u64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            decision_timeout_secs: 60,
            default_snooze_secs: 5 * 60,
        }
    }
}

impl ArbitrationConfig {
    /// Decision timeout as a [`Duration`].
    #[must_use]
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    /// Default snooze as a [`Duration`].
    #[must_use]
    pub fn default_snooze(&self) -> Duration {
        Duration::from_secs(self.default_snooze_secs)
    }
}

/// Activation slot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    /// Interval between elapsed-time ticks in milliseconds.
    pub tick_interval_ms: u64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

impl SlotConfig {
    /// Tick interval as a [`Duration`] (never zero).
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Offline mutation queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Base backoff in seconds (delay = base * 2^min(retries, max_backoff_exponent)).
    pub base_backoff_secs: u64,
    /// Retry ceiling; an operation is dropped once its retry count reaches it.
    pub max_retries: u32,
    /// Cap on the backoff exponent.
    pub max_backoff_exponent: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_backoff_secs: 2,
            max_retries: 3,
            max_backoff_exponent: 5,
        }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the JSON state file. `None` uses [`crate::attend_dirs::state_file`].
    pub state_file: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved state file path.
    #[must_use]
    pub fn resolved_state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(crate::attend_dirs::state_file)
    }
}

impl AttendConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AttendError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AttendError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only when the file exists but cannot be parsed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Returns the default config file path (`config_dir()/config.toml`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::attend_dirs::config_file()
    }
}
