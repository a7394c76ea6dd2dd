//! OS-level sandboxed execution
//!
//! Runs the program inside a bubblewrap jail: fresh user/pid/net/ipc/uts
//! namespaces, only read-only system directories and the read-only
//! workspace visible, uid/gid 65534, no capabilities. Memory and CPU share
//! are capped through a per-sandbox cgroup when one is configured. Without
//! one, memory is capped by RLIMIT_AS and the CPU share is not enforced;
//! the wall-clock deadline still bounds every run.

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ProcessSandboxConfig, RuntimeConfig, SandboxConfig};
use crate::error::{Error, Result};
use crate::sandbox::backend::{
    launch_command, IsolationBackend, ResourceTracker, Sandbox, WORKSPACE_MOUNT,
};
use crate::sandbox::cgroup::{enter_cgroup, Cgroup};
use crate::sandbox::process::ProcessSandbox;
use crate::sandbox::types::ExecutionConstraints;
use crate::sandbox::workspace::Workspace;

/// Identity of the sandboxed program ("nobody")
const SANDBOX_UID: u32 = 65534;

/// System directories bound read-only when they exist
const SYSTEM_DIRS: &[&str] = &["/bin", "/lib", "/lib32", "/lib64", "/sbin", "/etc/alternatives"];

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Bubblewrap jail backend
pub struct OsSandbox {
    /// Path to the bwrap binary
    bwrap: PathBuf,
    config: ProcessSandboxConfig,
    runtime: RuntimeConfig,
    tracker: Arc<ResourceTracker>,
}

impl OsSandbox {
    /// Create the backend, refusing to start when bubblewrap is unavailable
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let bwrap = match &config.process.bwrap_path {
            Some(path) if path.is_file() => path.clone(),
            Some(path) => {
                return Err(Error::Sandbox(format!(
                    "bubblewrap not found at {}; refusing to run without a jail",
                    path.display()
                )))
            }
            None => which::which("bwrap").map_err(|_| {
                Error::Sandbox(
                    "bubblewrap (bwrap) not found in PATH; refusing to run without a jail"
                        .to_string(),
                )
            })?,
        };

        for dir in &config.process.ro_binds {
            if !dir.exists() {
                warn!("Toolchain directory {} does not exist", dir.display());
            }
        }

        info!(
            "Process jail backend using {} (cgroup: {})",
            bwrap.display(),
            config
                .process
                .cgroup_parent
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none, CPU quota not enforced".to_string())
        );

        Ok(Self::with_bwrap(bwrap, config))
    }

    /// Create the backend with an explicit bwrap path, without probing it
    pub fn with_bwrap(bwrap: PathBuf, config: &SandboxConfig) -> Self {
        OsSandbox {
            bwrap,
            config: config.process.clone(),
            runtime: config.runtime.clone(),
            tracker: ResourceTracker::new(),
        }
    }

    /// Arguments placed before `--` on the bwrap command line
    fn jail_args(&self, workspace: &Path) -> Vec<OsString> {
        let uid = SANDBOX_UID.to_string();
        let mut args: Vec<OsString> = [
            "--unshare-all",
            "--unshare-user",
            "--die-with-parent",
            "--new-session",
            "--cap-drop",
            "ALL",
            "--uid",
            uid.as_str(),
            "--gid",
            uid.as_str(),
            "--hostname",
            "sandbox",
            "--ro-bind",
            "/usr",
            "/usr",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        for dir in SYSTEM_DIRS.iter().copied() {
            args.extend(["--ro-bind-try", dir, dir].map(OsString::from));
        }
        for dir in &self.config.ro_binds {
            args.push("--ro-bind".into());
            args.push(dir.into());
            args.push(dir.into());
        }

        args.extend(["--proc", "/proc", "--dev", "/dev"].map(OsString::from));
        args.push("--ro-bind".into());
        args.push(workspace.into());
        args.push(WORKSPACE_MOUNT.into());
        args.extend(["--chdir", WORKSPACE_MOUNT].map(OsString::from));
        args
    }

    /// RLIMIT_AS used when no cgroup caps memory
    fn address_space(&self, constraints: &ExecutionConstraints) -> u64 {
        self.config
            .address_space_limit_mb
            .map(|mb| mb.saturating_mul(1024 * 1024))
            .unwrap_or_else(|| constraints.memory_limit_bytes())
    }

    fn build_command(
        &self,
        workspace: &Workspace,
        constraints: &ExecutionConstraints,
        cgroup: Option<&Cgroup>,
    ) -> Command {
        let mut command = Command::new(&self.bwrap);
        command
            .args(self.jail_args(workspace.path()))
            .arg("--")
            .args(launch_command(
                &self.runtime.interpreter,
                workspace.main_file(),
                workspace.test_file(),
            ))
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", WORKSPACE_MOUNT)
            .env("LANG", "C.UTF-8");

        let limits = rlimits(constraints, cgroup.is_some(), self.address_space(constraints));
        let procs = cgroup.map(Cgroup::procs_path);

        // SAFETY: the hook only performs raw syscalls on pre-built data
        unsafe {
            command.pre_exec(move || {
                if let Some(procs) = &procs {
                    enter_cgroup(procs)?;
                }
                for (resource, limit) in &limits {
                    setrlimit(*resource, *limit, *limit).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        command
    }
}

/// Rlimits applied to the jail.
///
/// RLIMIT_CPU is only a backstop one second past the wall-clock limit, so
/// the deadline kill always comes first and an endless loop is reported as
/// a timeout. The CPU share itself is enforced by `cpu.max` when a cgroup
/// is configured and is not enforced otherwise. Without a cgroup,
/// RLIMIT_AS caps memory at `address_space` bytes.
fn rlimits(
    constraints: &ExecutionConstraints,
    has_cgroup: bool,
    address_space: u64,
) -> Vec<(Resource, u64)> {
    let backstop = constraints.wall_clock_timeout().as_secs_f64().ceil() as u64 + 1;
    let mut limits = vec![
        (Resource::RLIMIT_CORE, 0),
        (Resource::RLIMIT_FSIZE, 0),
        (Resource::RLIMIT_CPU, backstop),
    ];

    if !has_cgroup {
        limits.push((Resource::RLIMIT_AS, address_space));
    }

    limits
}

#[async_trait]
impl IsolationBackend for OsSandbox {
    fn name(&self) -> &str {
        "process"
    }

    async fn create_sandbox(
        &self,
        workspace: &Workspace,
        constraints: &ExecutionConstraints,
    ) -> Result<Box<dyn Sandbox>> {
        let id = format!("fluence-exec-{}", uuid::Uuid::new_v4().simple());

        let cgroup = match &self.config.cgroup_parent {
            Some(parent) => Some(Cgroup::create(parent, &id, constraints).await?),
            None => None,
        };

        let command = self.build_command(workspace, constraints, cgroup.as_ref());
        debug!("Prepared jail {} for {}", id, workspace.path().display());

        Ok(Box::new(ProcessSandbox::new(
            id,
            command,
            constraints.max_output_bytes(),
            cgroup,
            self.tracker.acquire(),
        )))
    }

    fn live_sandboxes(&self) -> usize {
        self.tracker.live()
    }
}
