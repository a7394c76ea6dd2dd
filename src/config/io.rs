//! Configuration I/O - Loading configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;
use std::time::Duration;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (config.json / config.toml) if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().map_or(false, |ext| ext == "json") {
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().map_or(false, |ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(Error::from))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays any set variables. Env vars have the
/// highest precedence: defaults < file < env. Unparseable values are ignored
/// with a warning so a typo never silently disables a limit.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup
pub(crate) fn apply_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Server overrides
    if let Some(host) = lookup("HOST") {
        config.server.host = host;
    }
    if let Some(port) = lookup("PORT") {
        set_parsed(&mut config.server.port, "PORT", &port);
    }
    if let Some(origins) = lookup("ALLOWED_ORIGINS") {
        config.server.allowed_origins = origins
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
    }

    // Sandbox overrides
    let sandbox = &mut config.sandbox;
    if let Some(env_str) = lookup("EXECUTION_ENV") {
        set_parsed(&mut sandbox.execution_env, "EXECUTION_ENV", &env_str);
    }
    if let Some(timeout) = lookup("EXECUTION_TIMEOUT") {
        match timeout.trim().parse::<u64>() {
            Ok(secs) => sandbox.timeout = Duration::from_secs(secs),
            Err(_) => tracing::warn!("Ignoring invalid EXECUTION_TIMEOUT: {}", timeout),
        }
    }
    if let Some(memory) = lookup("MAX_MEMORY_MB") {
        set_parsed(&mut sandbox.memory_limit_mb, "MAX_MEMORY_MB", &memory);
    }
    if let Some(quota) = lookup("CPU_QUOTA") {
        set_parsed(&mut sandbox.cpu_quota, "CPU_QUOTA", &quota);
    }
    if let Some(max) = lookup("SANDBOX_MAX_CONCURRENT") {
        set_parsed(&mut sandbox.max_concurrent, "SANDBOX_MAX_CONCURRENT", &max);
    }
    if let Some(root) = lookup("SANDBOX_WORKSPACE_ROOT") {
        sandbox.workspace_root = Some(root.into());
    }
    if let Some(interpreter) = lookup("SANDBOX_RUNTIME") {
        sandbox.runtime.interpreter = interpreter;
    }
    if let Some(ext) = lookup("SANDBOX_FILE_EXTENSION") {
        sandbox.runtime.file_extension = ext.trim_start_matches('.').to_string();
    }
    if let Some(image) = lookup("SANDBOX_IMAGE") {
        sandbox.container.image = image;
    }
    if let Some(pull) = lookup("SANDBOX_PULL_IMAGE") {
        sandbox.container.pull_missing_image = pull == "true" || pull == "1";
    }
    if let Some(bwrap) = lookup("SANDBOX_BWRAP_PATH") {
        sandbox.process.bwrap_path = Some(bwrap.into());
    }
    if let Some(parent) = lookup("SANDBOX_CGROUP_PARENT") {
        sandbox.process.cgroup_parent = Some(parent.into());
    }
    if let Some(limit) = lookup("SANDBOX_ADDRESS_SPACE_MB") {
        match limit.trim().parse::<u64>() {
            Ok(mb) => sandbox.process.address_space_limit_mb = Some(mb),
            Err(_) => tracing::warn!("Ignoring invalid SANDBOX_ADDRESS_SPACE_MB: {}", limit),
        }
    }

    // Logging overrides
    if let Some(format) = lookup("LOG_FORMAT") {
        set_parsed(&mut config.log.format, "LOG_FORMAT", &format);
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!("Ignoring invalid {}: {}", key, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionEnv, LogFormat};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        apply_overrides_from(
            &mut config,
            lookup_from(&[
                ("EXECUTION_TIMEOUT", "5"),
                ("MAX_MEMORY_MB", "256"),
                ("CPU_QUOTA", "0.25"),
                ("EXECUTION_ENV", "process"),
                ("SANDBOX_FILE_EXTENSION", ".py"),
                ("LOG_FORMAT", "json"),
                ("PORT", "9000"),
                ("SANDBOX_ADDRESS_SPACE_MB", "4096"),
            ]),
        );

        assert_eq!(config.sandbox.timeout, Duration::from_secs(5));
        assert_eq!(config.sandbox.memory_limit_mb, 256);
        assert_eq!(config.sandbox.cpu_quota, 0.25);
        assert_eq!(config.sandbox.execution_env, ExecutionEnv::Process);
        assert_eq!(config.sandbox.runtime.file_extension, "py");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.sandbox.process.address_space_limit_mb, Some(4096));
    }

    #[test]
    fn test_invalid_override_keeps_default() {
        let mut config = Config::default();
        apply_overrides_from(
            &mut config,
            lookup_from(&[("EXECUTION_TIMEOUT", "soon"), ("MAX_MEMORY_MB", "-1")]),
        );

        assert_eq!(config.sandbox.timeout, Duration::from_secs(30));
        assert_eq!(config.sandbox.memory_limit_mb, 128);
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[sandbox]\nexecution_env = \"process\"\ntimeout = \"10s\"\n\n[sandbox.runtime]\ninterpreter = \"python3\"\nfile_extension = \"py\"\n",
        )
        .unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.sandbox.execution_env, ExecutionEnv::Process);
        assert_eq!(config.sandbox.timeout, Duration::from_secs(10));
        assert_eq!(config.sandbox.runtime.interpreter, "python3");
    }

    #[test]
    fn test_load_json5_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            "{ sandbox: { memory_limit_mb: 64, container: { image: 'dart:stable' } } }",
        )
        .unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.sandbox.memory_limit_mb, 64);
        assert_eq!(config.sandbox.container.image, "dart:stable");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load_config_from_path(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
