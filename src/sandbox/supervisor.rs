//! Execution supervision
//!
//! Starts a sandbox, enforces the wall-clock deadline with a watchdog that
//! runs independently of the wait, and gathers the raw result.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sandbox::backend::Sandbox;
use crate::sandbox::types::{RawResult, KILLED_EXIT_CODE};

/// Extra time the wait is given after the watchdog fired before giving up on it
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Supervisor {
    kill_grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl Supervisor {
    pub fn new(kill_grace: Duration) -> Self {
        Supervisor { kill_grace }
    }

    /// Run a created sandbox to completion or until `deadline`.
    ///
    /// The watchdog kills the sandbox at the deadline whether or not the
    /// wait returns. A kill that fails is logged and the result is still a
    /// timeout; teardown is left to the reclaimer.
    pub async fn run(&self, sandbox: &mut dyn Sandbox, deadline: Instant) -> Result<RawResult> {
        sandbox.start().await?;

        let kill = sandbox.kill_switch();
        let id = sandbox.id().to_string();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!("Deadline reached for {}, killing", id);
            if let Err(e) = kill.kill().await {
                warn!("Watchdog kill failed for {}: {}", id, e);
            }
        });

        let waited = tokio::select! {
            result = sandbox.wait() => Some(result),
            _ = tokio::time::sleep_until(deadline + self.kill_grace) => None,
        };

        let timed_out = Instant::now() >= deadline;
        if !timed_out {
            watchdog.abort();
        } else if let Err(e) = watchdog.await {
            warn!("Watchdog task failed: {}", e);
        }

        let exit_code = match waited {
            Some(Ok(code)) if !timed_out => code,
            Some(Ok(_)) => KILLED_EXIT_CODE,
            Some(Err(e)) if !timed_out => return Err(e),
            Some(Err(e)) => {
                warn!("Wait failed after deadline kill of {}: {}", sandbox.id(), e);
                KILLED_EXIT_CODE
            }
            None => {
                warn!("Sandbox {} did not exit within the kill grace", sandbox.id());
                KILLED_EXIT_CODE
            }
        };

        let output = sandbox.collect_output().await?;
        let memory_exceeded = !timed_out && sandbox.memory_exceeded().await;

        Ok(RawResult {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out,
            memory_exceeded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backend::ResourceTracker;
    use crate::sandbox::process::ProcessSandbox;
    use tokio::process::Command;

    fn shell(script: &str) -> ProcessSandbox {
        let tracker = ResourceTracker::new();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        ProcessSandbox::new("supervised", cmd, 4096, None, tracker.acquire())
    }

    #[tokio::test]
    async fn test_completes_before_deadline() {
        let mut sb = shell("echo done; echo warn >&2; exit 4");
        let deadline = Instant::now() + Duration::from_secs(10);

        let raw = Supervisor::default().run(&mut sb, deadline).await.unwrap();
        sb.destroy().await.unwrap();

        assert_eq!(raw.exit_code, 4);
        assert_eq!(raw.stdout, "done\n");
        assert_eq!(raw.stderr, "warn\n");
        assert!(!raw.timed_out);
        assert!(!raw.memory_exceeded);
    }

    #[tokio::test]
    async fn test_deadline_kills_and_keeps_partial_output() {
        let mut sb = shell("echo started; while :; do :; done");
        let started = Instant::now();
        let deadline = started + Duration::from_millis(300);

        let raw = Supervisor::default().run(&mut sb, deadline).await.unwrap();
        sb.destroy().await.unwrap();

        assert!(raw.timed_out);
        assert_eq!(raw.exit_code, KILLED_EXIT_CODE);
        assert_eq!(raw.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let tracker = ResourceTracker::new();
        let cmd = Command::new("/nonexistent/interpreter");
        let mut sb = ProcessSandbox::new("broken", cmd, 4096, None, tracker.acquire());
        let deadline = Instant::now() + Duration::from_secs(1);

        assert!(Supervisor::default().run(&mut sb, deadline).await.is_err());
        sb.destroy().await.unwrap();
        assert_eq!(tracker.live(), 0);
    }
}
