//! Result classification

use tracing::error;

use crate::error::Error;
use crate::sandbox::types::{ExecutionOutcome, RawResult};

/// Classify what the supervisor observed.
///
/// A deadline kill is always a timeout, regardless of exit code.
pub fn classify(raw: RawResult, duration_ms: u64) -> ExecutionOutcome {
    if raw.timed_out {
        return ExecutionOutcome::Timeout {
            partial_stdout: raw.stdout,
            partial_stderr: raw.stderr,
            duration_ms,
        };
    }

    if raw.exit_code == 0 && !raw.memory_exceeded {
        ExecutionOutcome::Success {
            stdout: raw.stdout,
            duration_ms,
        }
    } else {
        ExecutionOutcome::RuntimeFailure {
            stdout: raw.stdout,
            stderr: raw.stderr,
            exit_code: raw.exit_code,
            memory_exceeded: raw.memory_exceeded,
            duration_ms,
        }
    }
}

/// Classify a failure of the execution machinery itself.
///
/// The detail is logged here and kept in the outcome for operators; callers
/// only ever see the generic message.
pub fn classify_error(err: &Error, duration_ms: u64) -> ExecutionOutcome {
    let source = error_source(err);
    error!(source, "Execution infrastructure failure: {}", err);
    ExecutionOutcome::InfrastructureError {
        message: err.to_string(),
        duration_ms,
    }
}

/// Where an infrastructure failure came from, for operators
fn error_source(err: &Error) -> &'static str {
    if err.is_infrastructure() {
        "isolation"
    } else {
        "internal"
    }
}
