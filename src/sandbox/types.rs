//! Request, constraint and outcome types shared by every stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SandboxConfig;
use crate::error::{Error, Result};

/// Exit code reported for a sandbox terminated by the deadline (128 + SIGKILL)
pub const KILLED_EXIT_CODE: i64 = 137;

/// External message for any infrastructure failure
pub const INFRASTRUCTURE_MESSAGE: &str = "Execution environment unavailable";

/// Submitted program plus optional test script.
///
/// Only constructible through [`ExecutionRequest::new`], so an accepted
/// request always has non-empty source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    source_code: String,
    test_script: Option<String>,
}

impl ExecutionRequest {
    /// Validate and accept a request.
    ///
    /// A blank test script is treated as absent.
    pub fn new(source_code: impl Into<String>, test_script: Option<String>) -> Result<Self> {
        let source_code = source_code.into();
        if source_code.trim().is_empty() {
            return Err(Error::InvalidInput("source code must not be empty".to_string()));
        }

        Ok(ExecutionRequest {
            source_code,
            test_script: test_script.filter(|s| !s.trim().is_empty()),
        })
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn test_script(&self) -> Option<&str> {
        self.test_script.as_deref()
    }

    pub fn has_test(&self) -> bool {
        self.test_script.is_some()
    }
}

/// Resource budget and isolation policy applied to every sandbox.
///
/// The isolation policy (no network, read-only filesystem, unprivileged
/// user, all capabilities dropped) is fixed and has no setters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConstraints {
    memory_limit_bytes: u64,
    cpu_quota: f64,
    wall_clock_timeout: Duration,
    max_output_bytes: usize,
    pids_limit: u32,
}

impl ExecutionConstraints {
    /// Create constraints, rejecting out-of-range limits
    pub fn new(memory_limit_bytes: u64, cpu_quota: f64, wall_clock_timeout: Duration) -> Result<Self> {
        if memory_limit_bytes == 0 {
            return Err(Error::Config("memory limit must be greater than zero".to_string()));
        }
        if !(cpu_quota > 0.0 && cpu_quota <= 1.0) {
            return Err(Error::Config(format!(
                "CPU quota must be in (0, 1], got {}",
                cpu_quota
            )));
        }
        if wall_clock_timeout.is_zero() {
            return Err(Error::Config("timeout must be greater than zero".to_string()));
        }

        Ok(ExecutionConstraints {
            memory_limit_bytes,
            cpu_quota,
            wall_clock_timeout,
            max_output_bytes: 1024 * 1024,
            pids_limit: 64,
        })
    }

    /// Build constraints from the sandbox configuration
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let memory = config
            .memory_limit_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| Error::Config("memory limit overflows".to_string()))?;

        Ok(Self::new(memory, config.cpu_quota, config.timeout)?
            .with_max_output_bytes(config.max_output_bytes)
            .with_pids_limit(config.pids_limit.max(1)))
    }

    /// Set the per-stream capture cap
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Set the process/thread cap
    pub fn with_pids_limit(mut self, limit: u32) -> Self {
        self.pids_limit = limit;
        self
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn cpu_quota(&self) -> f64 {
        self.cpu_quota
    }

    pub fn wall_clock_timeout(&self) -> Duration {
        self.wall_clock_timeout
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    pub fn pids_limit(&self) -> u32 {
        self.pids_limit
    }

    pub fn network_enabled(&self) -> bool {
        false
    }

    pub fn filesystem_writable(&self) -> bool {
        false
    }

    pub fn run_as_unprivileged(&self) -> bool {
        true
    }

    /// Capabilities removed from the sandboxed process
    pub fn dropped_capabilities(&self) -> &'static str {
        "ALL"
    }
}

/// What the supervisor observed, before classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResult {
    /// Exit code, or [`KILLED_EXIT_CODE`] when the deadline fired
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Terminated by the wall-clock deadline
    pub timed_out: bool,
    /// Killed by the backend for exceeding the memory cap
    pub memory_exceeded: bool,
}

/// Typed result of one execution. Exactly one variant per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        duration_ms: u64,
    },
    RuntimeFailure {
        stdout: String,
        stderr: String,
        exit_code: i64,
        memory_exceeded: bool,
        duration_ms: u64,
    },
    Timeout {
        partial_stdout: String,
        partial_stderr: String,
        duration_ms: u64,
    },
    InfrastructureError {
        /// Internal detail; never sent to callers
        message: String,
        duration_ms: u64,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Failures caused by the platform rather than by the submitted code
    pub fn is_infrastructure_error(&self) -> bool {
        matches!(self, ExecutionOutcome::InfrastructureError { .. })
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::RuntimeFailure { .. } => "runtime_failure",
            ExecutionOutcome::Timeout { .. } => "timeout",
            ExecutionOutcome::InfrastructureError { .. } => "infrastructure_error",
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            ExecutionOutcome::Success { duration_ms, .. }
            | ExecutionOutcome::RuntimeFailure { duration_ms, .. }
            | ExecutionOutcome::Timeout { duration_ms, .. }
            | ExecutionOutcome::InfrastructureError { duration_ms, .. } => *duration_ms,
        }
    }
}

/// Response shape consumed by the HTTP boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub success: bool,
    pub output: String,
    pub errors: Option<String>,
    /// Seconds, measured end-to-end
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResponse {
    /// Map an outcome to the external shape.
    ///
    /// `timeout` is the configured wall-clock limit, quoted in the timeout
    /// message.
    pub fn from_outcome(outcome: &ExecutionOutcome, timeout: Duration) -> Self {
        let (success, output, errors) = match outcome {
            ExecutionOutcome::Success { stdout, .. } => (true, stdout.clone(), None),
            ExecutionOutcome::RuntimeFailure {
                stdout,
                stderr,
                exit_code,
                memory_exceeded,
                ..
            } => {
                let mut parts = Vec::new();
                if !stderr.is_empty() {
                    parts.push(stderr.clone());
                }
                if *memory_exceeded {
                    parts.push("Memory limit exceeded".to_string());
                }
                if parts.is_empty() {
                    parts.push(format!("Process exited with code {}", exit_code));
                }
                (false, stdout.clone(), Some(parts.join("\n")))
            }
            ExecutionOutcome::Timeout {
                partial_stdout,
                partial_stderr,
                ..
            } => {
                let mut message = timeout_message(timeout);
                if !partial_stderr.is_empty() {
                    message.push('\n');
                    message.push_str(partial_stderr);
                }
                (false, partial_stdout.clone(), Some(message))
            }
            ExecutionOutcome::InfrastructureError { .. } => {
                (false, String::new(), Some(INFRASTRUCTURE_MESSAGE.to_string()))
            }
        };

        ExecutionResponse {
            success,
            output,
            errors,
            execution_time: outcome.duration_ms() as f64 / 1000.0,
            timestamp: Utc::now(),
        }
    }
}

/// Fixed diagnostic for a deadline kill
pub fn timeout_message(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("Code execution timed out after {}s", timeout.as_secs())
    } else {
        format!("Code execution timed out after {:.1}s", timeout.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_rejects_blank_source() {
        assert!(ExecutionRequest::new("", None).unwrap_err().is_client_error());
        assert!(ExecutionRequest::new("  \n\t", None).is_err());
    }

    #[test]
    fn test_blank_test_script_is_absent() {
        let req = ExecutionRequest::new("void main() {}", Some("   ".to_string())).unwrap();
        assert!(!req.has_test());

        let req = ExecutionRequest::new("void main() {}", Some("check();".to_string())).unwrap();
        assert_eq!(req.test_script(), Some("check();"));
    }

    #[test]
    fn test_constraints_from_config() {
        let config = SandboxConfig::default();
        let constraints = ExecutionConstraints::from_config(&config).unwrap();

        assert_eq!(constraints.memory_limit_bytes(), 128 * 1024 * 1024);
        assert_eq!(constraints.cpu_quota(), 0.5);
        assert_eq!(constraints.wall_clock_timeout(), Duration::from_secs(30));
        assert!(!constraints.network_enabled());
        assert!(!constraints.filesystem_writable());
        assert!(constraints.run_as_unprivileged());
        assert_eq!(constraints.dropped_capabilities(), "ALL");
    }

    #[test]
    fn test_constraints_reject_bad_values() {
        assert!(ExecutionConstraints::new(0, 0.5, Duration::from_secs(1)).is_err());
        assert!(ExecutionConstraints::new(1024, 0.0, Duration::from_secs(1)).is_err());
        assert!(ExecutionConstraints::new(1024, 1.01, Duration::from_secs(1)).is_err());
        assert!(ExecutionConstraints::new(1024, 1.0, Duration::ZERO).is_err());
        assert!(ExecutionConstraints::new(1024, 1.0, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_success_response_has_no_errors() {
        let outcome = ExecutionOutcome::Success {
            stdout: "hello\n".to_string(),
            duration_ms: 1500,
        };
        let response = ExecutionResponse::from_outcome(&outcome, Duration::from_secs(30));

        assert!(response.success);
        assert_eq!(response.output, "hello\n");
        assert_eq!(response.errors, None);
        assert_eq!(response.execution_time, 1.5);
    }

    #[test]
    fn test_failure_response_always_has_errors() {
        let outcome = ExecutionOutcome::RuntimeFailure {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 2,
            memory_exceeded: false,
            duration_ms: 10,
        };
        let response = ExecutionResponse::from_outcome(&outcome, Duration::from_secs(30));
        assert!(!response.success);
        assert_eq!(response.errors.as_deref(), Some("Process exited with code 2"));

        let oom = ExecutionOutcome::RuntimeFailure {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: KILLED_EXIT_CODE,
            memory_exceeded: true,
            duration_ms: 10,
        };
        let response = ExecutionResponse::from_outcome(&oom, Duration::from_secs(30));
        assert_eq!(response.errors.as_deref(), Some("Memory limit exceeded"));
    }

    #[test]
    fn test_timeout_response() {
        let outcome = ExecutionOutcome::Timeout {
            partial_stdout: "tick\n".to_string(),
            partial_stderr: String::new(),
            duration_ms: 2050,
        };
        let response = ExecutionResponse::from_outcome(&outcome, Duration::from_secs(2));

        assert!(!response.success);
        assert_eq!(response.output, "tick\n");
        assert_eq!(
            response.errors.as_deref(),
            Some("Code execution timed out after 2s")
        );
    }

    #[test]
    fn test_infrastructure_response_is_generic() {
        let outcome = ExecutionOutcome::InfrastructureError {
            message: "Failed to create container: /var/run/docker.sock refused".to_string(),
            duration_ms: 3,
        };
        let response = ExecutionResponse::from_outcome(&outcome, Duration::from_secs(30));

        assert!(!response.success);
        assert_eq!(response.errors.as_deref(), Some(INFRASTRUCTURE_MESSAGE));
        assert!(outcome.is_infrastructure_error());
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let outcome = ExecutionOutcome::Success {
            stdout: "x".to_string(),
            duration_ms: 1,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
    }
}
