//! Centralized directory paths for attend.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/attend/` | `~/.local/share/attend/` |
//! | Config | `~/Library/Application Support/attend/` | `~/.config/attend/` |
//!
//! # Environment Overrides
//!
//! - `ATTEND_DATA_DIR` overrides [`data_dir`]
//! - `ATTEND_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Holds the durable key-value state file (pending snoozes, offline queue,
/// handoff flags).
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("ATTEND_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("attend"))
        .unwrap_or_else(|| PathBuf::from("/tmp/attend-data"))
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("ATTEND_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("attend"))
        .unwrap_or_else(|| PathBuf::from("/tmp/attend-config"))
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Durable key-value state file (`data_dir()/state.json`).
#[must_use]
pub fn state_file() -> PathBuf {
    data_dir().join("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_lives_under_config_dir() {
        let file = config_file();
        assert!(file.starts_with(config_dir()));
        assert_eq!(file.file_name().and_then(|n| n.to_str()), Some("config.toml"));
    }

    #[test]
    fn state_file_lives_under_data_dir() {
        let file = state_file();
        assert!(file.starts_with(data_dir()));
        assert_eq!(file.file_name().and_then(|n| n.to_str()), Some("state.json"));
    }
}
