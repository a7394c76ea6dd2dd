//! Per-sandbox cgroup v2 limits
//!
//! Used by the process jail when a delegated cgroup subtree is configured.
//! The parent must have the `memory`, `cpu` and `pids` controllers enabled
//! in its `cgroup.subtree_control`.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sandbox::types::ExecutionConstraints;

/// Scheduler period used for `cpu.max`, in microseconds
const CPU_PERIOD_US: u64 = 100_000;

/// A child cgroup owned by one sandbox
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    procs: CString,
}

impl Cgroup {
    /// Create `<parent>/<name>` and write the limits into it
    pub async fn create(parent: &Path, name: &str, constraints: &ExecutionConstraints) -> Result<Self> {
        let path = parent.join(name);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to create cgroup {}: {}", path.display(), e)))?;

        let procs = CString::new(path.join("cgroup.procs").as_os_str().as_bytes())
            .map_err(|e| Error::Sandbox(format!("Invalid cgroup path: {}", e)))?;
        let cgroup = Cgroup { path, procs };

        if let Err(e) = cgroup.apply_limits(constraints).await {
            if let Err(rm) = tokio::fs::remove_dir(&cgroup.path).await {
                warn!("Failed to remove cgroup {}: {}", cgroup.path.display(), rm);
            }
            return Err(e);
        }

        debug!("Created cgroup {}", cgroup.path.display());
        Ok(cgroup)
    }

    async fn apply_limits(&self, constraints: &ExecutionConstraints) -> Result<()> {
        let quota = ((constraints.cpu_quota() * CPU_PERIOD_US as f64).round() as u64).max(1_000);

        self.write("memory.max", &constraints.memory_limit_bytes().to_string())
            .await?;
        self.write("cpu.max", &format!("{} {}", quota, CPU_PERIOD_US))
            .await?;
        self.write("pids.max", &constraints.pids_limit().to_string())
            .await?;

        // Optional knobs: absent without swap accounting / on older kernels
        if let Err(e) = self.write("memory.swap.max", "0").await {
            debug!("memory.swap.max not set: {}", e);
        }
        if let Err(e) = self.write("memory.oom.group", "1").await {
            debug!("memory.oom.group not set: {}", e);
        }

        Ok(())
    }

    async fn write(&self, file: &str, value: &str) -> Result<()> {
        tokio::fs::write(self.path.join(file), value)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to write {}={}: {}", file, value, e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `cgroup.procs`, prepared for use after fork
    pub(crate) fn procs_path(&self) -> CString {
        self.procs.clone()
    }

    /// Kill every process in the cgroup
    pub async fn kill(&self) -> Result<()> {
        match tokio::fs::write(self.path.join("cgroup.kill"), "1").await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Sandbox(format!("Failed to write cgroup.kill: {}", e))),
        }
    }

    /// Whether the kernel OOM-killed anything in this cgroup
    pub async fn oom_killed(&self) -> bool {
        match tokio::fs::read_to_string(self.path.join("memory.events")).await {
            Ok(events) => parse_oom_kills(&events) > 0,
            Err(_) => false,
        }
    }

    /// Remove the cgroup, retrying while killed processes are still exiting
    pub async fn remove(&self) -> Result<()> {
        let mut last_err = None;
        for _ in 0..20 {
            match tokio::fs::remove_dir(&self.path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }

        Err(Error::Sandbox(format!(
            "Failed to remove cgroup {}: {}",
            self.path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Move the calling process into the cgroup whose `cgroup.procs` is `procs`.
///
/// Runs between fork and exec, so it only issues raw syscalls.
pub(crate) fn enter_cgroup(procs: &CStr) -> std::io::Result<()> {
    // SAFETY: plain open/write/close on a NUL-terminated path
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // "0" means the writing process itself
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if written != 1 {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_oom_kills() {
        let events = "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(parse_oom_kills(events), 1);
        assert_eq!(parse_oom_kills("oom 0\noom_kill 0\n"), 0);
        assert_eq!(parse_oom_kills(""), 0);
    }

    #[tokio::test]
    async fn test_limits_written() {
        // A plain directory stands in for cgroupfs: the files are just created
        let parent = tempdir().unwrap();
        let constraints =
            ExecutionConstraints::new(64 * 1024 * 1024, 0.5, Duration::from_secs(5)).unwrap();

        let cgroup = Cgroup::create(parent.path(), "sb-1", &constraints).await.unwrap();
        let read = |f: &str| std::fs::read_to_string(cgroup.path().join(f)).unwrap();

        assert_eq!(read("memory.max"), "67108864");
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("pids.max"), "64");
        assert!(cgroup.procs_path().to_str().unwrap().ends_with("sb-1/cgroup.procs"));

        std::fs::write(cgroup.path().join("memory.events"), "oom 1\noom_kill 2\n").unwrap();
        assert!(cgroup.oom_killed().await);
    }

    #[tokio::test]
    async fn test_create_fails_without_parent() {
        let constraints =
            ExecutionConstraints::new(1024 * 1024, 1.0, Duration::from_secs(1)).unwrap();
        let err = Cgroup::create(Path::new("/nonexistent/cgroup"), "x", &constraints)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
    }
}
