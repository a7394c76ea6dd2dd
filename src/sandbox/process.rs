//! Process-group sandbox primitive
//!
//! Wraps a prepared [`Command`] so that the spawned program leads its own
//! process group, has its output drained concurrently into capped buffers,
//! and can be killed as a whole group from any task.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sandbox::backend::{CaptureBuffer, CapturedOutput, KillSwitch, LiveToken, Sandbox};
use crate::sandbox::cgroup::Cgroup;

/// How long to wait for pipes to reach EOF after the program exited
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How long to wait for the killed group leader to be reaped
const REAP_GRACE: Duration = Duration::from_secs(2);

/// A program running in its own process group
pub struct ProcessSandbox {
    id: String,
    command: Option<Command>,
    child: Option<Child>,
    pgid: Option<Pid>,
    stdout: Option<OutputCapture>,
    stderr: Option<OutputCapture>,
    max_output: usize,
    cgroup: Option<Arc<Cgroup>>,
    group: Arc<GroupState>,
    token: Option<LiveToken>,
}

/// What is known about a process group without signalling it
#[derive(Debug, Default)]
struct GroupState {
    leader_reaped: AtomicBool,
    open_pipes: AtomicUsize,
}

impl GroupState {
    /// A pgid stays allocated while any member lives, and an open pipe means
    /// a member still holds it. With the leader reaped and both pipes at EOF
    /// the number may already name an unrelated group.
    fn may_signal(&self) -> bool {
        !self.leader_reaped.load(Ordering::Acquire) || self.open_pipes.load(Ordering::Acquire) > 0
    }
}

impl ProcessSandbox {
    /// Take ownership of a prepared command.
    ///
    /// Stdio and process-group settings are applied here; the caller sets
    /// program, arguments, environment and any `pre_exec` hooks.
    pub fn new(
        id: impl Into<String>,
        mut command: Command,
        max_output: usize,
        cgroup: Option<Cgroup>,
        token: LiveToken,
    ) -> Self {
        command
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        ProcessSandbox {
            id: id.into(),
            command: Some(command),
            child: None,
            pgid: None,
            stdout: None,
            stderr: None,
            max_output,
            cgroup: cgroup.map(Arc::new),
            group: Arc::new(GroupState::default()),
            token: Some(token),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.token.is_none()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> Result<()> {
        let mut command = self
            .command
            .take()
            .ok_or_else(|| Error::Sandbox(format!("Sandbox {} already started", self.id)))?;

        let mut child = command
            .spawn()
            .map_err(|e| Error::Sandbox(format!("Failed to spawn process: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Sandbox("Spawned process has no pid".to_string()))?;
        // process_group(0) makes the child its own group leader
        self.pgid = Some(Pid::from_raw(pid as i32));

        self.stdout = child
            .stdout
            .take()
            .map(|pipe| OutputCapture::spawn(pipe, self.max_output, &self.group));
        self.stderr = child
            .stderr
            .take()
            .map(|pipe| OutputCapture::spawn(pipe, self.max_output, &self.group));
        self.child = Some(child);

        debug!("Started sandbox {} (pgid {})", self.id, pid);
        Ok(())
    }

    async fn wait(&mut self) -> Result<i64> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| Error::Sandbox(format!("Sandbox {} not started", self.id)))?;

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Sandbox(format!("Process error: {}", e)))?;
        self.group.leader_reaped.store(true, Ordering::Release);

        Ok(exit_code(status))
    }

    fn kill_switch(&self) -> Arc<dyn KillSwitch> {
        Arc::new(ProcessKill {
            pgid: self.pgid,
            cgroup: self.cgroup.clone(),
            group: Arc::clone(&self.group),
        })
    }

    async fn collect_output(&mut self) -> Result<CapturedOutput> {
        let stdout = match self.stdout.take() {
            Some(capture) => capture.finish().await,
            None => String::new(),
        };
        let stderr = match self.stderr.take() {
            Some(capture) => capture.finish().await,
            None => String::new(),
        };

        Ok(CapturedOutput { stdout, stderr })
    }

    async fn memory_exceeded(&mut self) -> bool {
        match &self.cgroup {
            Some(cgroup) => cgroup.oom_killed().await,
            None => false,
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.command = None;

        if let Err(e) = self.kill_switch().kill().await {
            warn!("Failed to kill sandbox {}: {}", self.id, e);
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(REAP_GRACE, child.wait()).await {
                Ok(Ok(_)) => self.group.leader_reaped.store(true, Ordering::Release),
                Ok(Err(e)) => warn!("Failed to reap sandbox {}: {}", self.id, e),
                Err(_) => warn!("Sandbox {} did not exit after SIGKILL", self.id),
            }
        }

        for capture in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            capture.task.abort();
        }

        if let Some(cgroup) = &self.cgroup {
            cgroup.remove().await?;
        }

        if let Some(token) = self.token.take() {
            token.release();
        }
        debug!("Destroyed sandbox {}", self.id);
        Ok(())
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        // Reached without destroy() only on a panic path
        if !self.is_destroyed() && self.group.may_signal() {
            if let Some(pgid) = self.pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
    }
}

/// Kills a whole process group, and its cgroup when there is one
struct ProcessKill {
    pgid: Option<Pid>,
    cgroup: Option<Arc<Cgroup>>,
    group: Arc<GroupState>,
}

#[async_trait]
impl KillSwitch for ProcessKill {
    async fn kill(&self) -> Result<()> {
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.kill().await {
                warn!("cgroup.kill failed: {}", e);
            }
        }

        match self.pgid {
            Some(pgid) if !self.group.may_signal() => {
                debug!("Process group {} already gone, not signalling", pgid);
                Ok(())
            }
            Some(pgid) => match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(Error::Sandbox(format!("Failed to kill process group {}: {}", pgid, e))),
            },
            None => Ok(()),
        }
    }
}

/// Background reader draining one pipe into a capped buffer
struct OutputCapture {
    buffer: Arc<Mutex<CaptureBuffer>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn spawn<R>(mut pipe: R, limit: usize, group: &Arc<GroupState>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(limit)));
        let sink = Arc::clone(&buffer);
        let group = Arc::clone(group);
        group.open_pipes.fetch_add(1, Ordering::AcqRel);

        // Keeps reading past the cap so the writer never blocks on a full pipe
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.lock() {
                            buf.push(&chunk[..n]);
                        }
                    }
                }
            }
            // Not reached when aborted, so a held pipe keeps counting as open
            group.open_pipes.fetch_sub(1, Ordering::AcqRel);
        });

        OutputCapture { buffer, task }
    }

    /// Wait briefly for EOF, then return whatever was captured
    async fn finish(mut self) -> String {
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            // A descendant still holds the pipe open
            self.task.abort();
        }

        match self.buffer.lock() {
            Ok(mut buf) => buf.take_string(),
            Err(poisoned) => poisoned.into_inner().take_string(),
        }
    }
}

/// Exit code of a process, with signal deaths mapped to 128 + signo
pub(crate) fn exit_code(status: ExitStatus) -> i64 {
    match status.code() {
        Some(code) => code as i64,
        None => 128 + status.signal().unwrap_or(0) as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backend::{ResourceTracker, TRUNCATION_MARKER};
    use std::time::Instant;

    fn shell(script: &str, max_output: usize) -> (ProcessSandbox, Arc<ResourceTracker>) {
        let tracker = ResourceTracker::new();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        let sandbox = ProcessSandbox::new("test", cmd, max_output, None, tracker.acquire());
        (sandbox, tracker)
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let (mut sb, tracker) = shell("echo out; echo err >&2; exit 3", 1024);
        sb.start().await.unwrap();
        assert_eq!(sb.wait().await.unwrap(), 3);

        let output = sb.collect_output().await.unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");

        sb.destroy().await.unwrap();
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let (mut sb, _tracker) = shell("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done", 16);
        sb.start().await.unwrap();
        assert_eq!(sb.wait().await.unwrap(), 0);

        let output = sb.collect_output().await.unwrap();
        assert_eq!(output.stdout, format!("0123456789\n01234{}", TRUNCATION_MARKER));
        sb.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_switch_kills_whole_group() {
        let (mut sb, tracker) = shell("sleep 30 & sleep 30; echo never", 1024);
        sb.start().await.unwrap();

        let kill = sb.kill_switch();
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            kill.kill().await.unwrap();
        });

        let code = sb.wait().await.unwrap();
        assert_eq!(code, 128 + libc::SIGKILL as i64);

        // The background sleep held stdout open; it must be gone too
        let output = sb.collect_output().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(output.stdout, "");

        sb.destroy().await.unwrap();
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_exited_group_is_not_signalled_again() {
        let (mut sb, tracker) = shell("echo done", 1024);
        sb.start().await.unwrap();
        assert!(sb.group.may_signal());

        assert_eq!(sb.wait().await.unwrap(), 0);
        let output = sb.collect_output().await.unwrap();
        assert_eq!(output.stdout, "done\n");

        // Leader reaped and both pipes at EOF: the pgid is free for reuse
        assert!(!sb.group.may_signal());
        sb.kill_switch().kill().await.unwrap();
        sb.destroy().await.unwrap();
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_descendant_holding_pipe_is_still_killed_after_leader_exits() {
        let (mut sb, tracker) = shell("sleep 30 & echo started", 1024);
        sb.start().await.unwrap();
        assert_eq!(sb.wait().await.unwrap(), 0);

        // The background sleep keeps stdout open, so the group is still ours
        assert!(sb.group.may_signal());
        let started = Instant::now();
        sb.kill_switch().kill().await.unwrap();

        let output = sb.collect_output().await.unwrap();
        assert_eq!(output.stdout, "started\n");
        assert!(started.elapsed() < OUTPUT_DRAIN_GRACE);
        assert!(!sb.group.may_signal());

        sb.destroy().await.unwrap();
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_works_unstarted() {
        let (mut sb, tracker) = shell("echo hi", 1024);
        sb.destroy().await.unwrap();
        sb.destroy().await.unwrap();
        assert_eq!(tracker.live(), 0);
        assert!(sb.start().await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_sandbox_error() {
        let tracker = ResourceTracker::new();
        let cmd = Command::new("/nonexistent/interpreter");
        let mut sb = ProcessSandbox::new("missing", cmd, 1024, None, tracker.acquire());

        let err = sb.start().await.unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
        sb.destroy().await.unwrap();
        assert_eq!(tracker.live(), 0);
    }
}
