//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_limits(config, result);
    result = validate_runtime(config, result);
    result = validate_backend(config, result);

    result
}

fn validate_limits(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let sandbox = &config.sandbox;

    if sandbox.timeout.is_zero() {
        result = result.with_error(
            ValidationIssue::new("sandbox.timeout", "Execution timeout must be greater than zero")
                .with_suggestion("Set EXECUTION_TIMEOUT to a positive number of seconds"),
        );
    }

    if sandbox.memory_limit_mb == 0 {
        result = result.with_error(
            ValidationIssue::new("sandbox.memory_limit_mb", "Memory limit must be greater than zero")
                .with_suggestion("Set MAX_MEMORY_MB, e.g. 128"),
        );
    }

    if !(sandbox.cpu_quota > 0.0 && sandbox.cpu_quota <= 1.0) {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.cpu_quota",
                format!("CPU quota must be in (0, 1], got {}", sandbox.cpu_quota),
            )
            .with_suggestion("Set CPU_QUOTA, e.g. 0.5"),
        );
    }

    if sandbox.pids_limit == 0 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.pids_limit",
            "Process limit must be greater than zero",
        ));
    }

    if sandbox.max_output_bytes < 1024 {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.max_output_bytes",
            "Output capture limit is below 1KB; most program output will be truncated",
        ));
    }

    result
}

fn validate_runtime(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let runtime = &config.sandbox.runtime;

    if runtime.interpreter.trim().is_empty() {
        result = result.with_error(
            ValidationIssue::new("sandbox.runtime.interpreter", "No interpreter configured")
                .with_suggestion("Set SANDBOX_RUNTIME, e.g. dart"),
        );
    }

    let ext = &runtime.file_extension;
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        result = result.with_error(ValidationIssue::new(
            "sandbox.runtime.file_extension",
            format!("File extension must be non-empty and alphanumeric, got {:?}", ext),
        ));
    }

    result
}

fn validate_backend(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    use super::types::sandbox::ExecutionEnv;

    match config.sandbox.execution_env {
        ExecutionEnv::Container => {
            if config.sandbox.container.image.is_empty() {
                result = result.with_error(
                    ValidationIssue::new(
                        "sandbox.container.image",
                        "Container execution selected but no image specified",
                    )
                    .with_suggestion("Set SANDBOX_IMAGE to the hardened sandbox image"),
                );
            }
        }
        ExecutionEnv::Process => match &config.sandbox.process.cgroup_parent {
            Some(parent) if !parent.is_dir() => {
                result = result.with_error(
                    ValidationIssue::new(
                        "sandbox.process.cgroup_parent",
                        format!("Cgroup directory does not exist: {}", parent.display()),
                    )
                    .with_suggestion("Delegate a cgroup v2 subtree to this service user"),
                );
            }
            Some(_) => {}
            None => {
                let address_space = config
                    .sandbox
                    .process
                    .address_space_limit_mb
                    .unwrap_or(config.sandbox.memory_limit_mb);
                result = result.with_warning(
                    ValidationIssue::new(
                        "sandbox.process.cgroup_parent",
                        format!(
                            "No cgroup configured; the CPU quota is not enforced and memory is \
                             capped by RLIMIT_AS ({}MB of address space), which VM runtimes \
                             such as dart can exceed at startup",
                            address_space
                        ),
                    )
                    .with_suggestion(
                        "Set SANDBOX_CGROUP_PARENT, or raise SANDBOX_ADDRESS_SPACE_MB for the runtime",
                    ),
                );
            }
        },
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionEnv;
    use std::time::Duration;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        let result = validate_config(&config);

        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_rejects_bad_limits() {
        let mut config = Config::default();
        config.sandbox.timeout = Duration::ZERO;
        config.sandbox.cpu_quota = 1.5;
        config.sandbox.memory_limit_mb = 0;

        let result = validate_config(&config);
        assert!(!result.valid);
        let paths: Vec<&str> = result.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"sandbox.timeout"));
        assert!(paths.contains(&"sandbox.cpu_quota"));
        assert!(paths.contains(&"sandbox.memory_limit_mb"));
    }

    #[test]
    fn test_rejects_path_like_extension() {
        let mut config = Config::default();
        config.sandbox.runtime.file_extension = "../x".to_string();

        let result = validate_config(&config);
        assert!(!result.valid);
    }

    #[test]
    fn test_process_backend_without_cgroup_warns() {
        let mut config = Config::default();
        config.sandbox.execution_env = ExecutionEnv::Process;

        let result = validate_config(&config);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("CPU quota is not enforced"));
        assert!(result.warnings[0].message.contains("128MB"));

        config.sandbox.process.address_space_limit_mb = Some(4096);
        let result = validate_config(&config);
        assert!(result.warnings[0].message.contains("4096MB"));
    }
}
