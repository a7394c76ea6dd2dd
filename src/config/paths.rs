//! Configuration paths
//!
//! Utilities for resolving configuration file paths.

use std::path::PathBuf;

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("FLUENCE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG config directory or fallback
    dirs::config_dir()
        .map(|d| d.join("fluence-runner"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("fluence-runner"))
                .unwrap_or_else(|| PathBuf::from(".fluence-runner"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var("FLUENCE_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

/// Get the default parent directory for execution workspaces
pub fn workspace_root() -> PathBuf {
    std::env::temp_dir()
}
