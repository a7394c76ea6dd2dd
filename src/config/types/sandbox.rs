//! Sandbox configuration types
//!
//! Configuration for the isolation backends (container, process jail) and
//! the resource budget every execution runs under.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Isolation backend
    #[serde(default)]
    pub execution_env: ExecutionEnv,
    /// Wall-clock limit for a single execution
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Hard memory cap in megabytes
    #[serde(default = "default_memory_mb")]
    pub memory_limit_mb: u64,
    /// Fraction of one CPU the program may use, in (0, 1]
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: f64,
    /// Maximum captured bytes per output stream
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    /// Maximum number of processes/threads inside a sandbox
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Maximum executions in flight (0 = unlimited)
    #[serde(default)]
    pub max_concurrent: usize,
    /// Parent directory for per-request workspaces (default: system temp dir)
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Language runtime used to run submitted files
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Container backend configuration
    #[serde(default)]
    pub container: ContainerConfig,
    /// Process jail backend configuration
    #[serde(default)]
    pub process: ProcessSandboxConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            execution_env: ExecutionEnv::default(),
            timeout: default_timeout(),
            memory_limit_mb: default_memory_mb(),
            cpu_quota: default_cpu_quota(),
            max_output_bytes: default_max_output(),
            pids_limit: default_pids_limit(),
            max_concurrent: 0,
            workspace_root: None,
            runtime: RuntimeConfig::default(),
            container: ContainerConfig::default(),
            process: ProcessSandboxConfig::default(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_memory_mb() -> u64 {
    128
}

fn default_cpu_quota() -> f64 {
    0.5
}

fn default_max_output() -> usize {
    1024 * 1024 // 1MB
}

fn default_pids_limit() -> u32 {
    64
}

/// Isolation backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEnv {
    /// Ephemeral Docker container
    #[default]
    Container,
    /// Bubblewrap jail around a host process group
    Process,
}

impl std::str::FromStr for ExecutionEnv {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container" | "docker" => Ok(ExecutionEnv::Container),
            "process" | "jail" | "bwrap" => Ok(ExecutionEnv::Process),
            _ => Err(crate::error::Error::Config(format!(
                "Invalid execution environment: {}. Valid: container, process",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ExecutionEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionEnv::Container => write!(f, "container"),
            ExecutionEnv::Process => write!(f, "process"),
        }
    }
}

/// Language runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interpreter invoked as `<interpreter> <file>`
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Extension of the files written into the workspace
    #[serde(default = "default_extension")]
    pub file_extension: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            interpreter: default_interpreter(),
            file_extension: default_extension(),
        }
    }
}

fn default_interpreter() -> String {
    "dart".to_string()
}

fn default_extension() -> String {
    "dart".to_string()
}

/// Container (Docker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Hardened image to run submissions in
    #[serde(default = "default_image")]
    pub image: String,
    /// Pull the image when it is not present locally
    #[serde(default)]
    pub pull_missing_image: bool,
    /// Remove labelled containers left behind by a previous run at startup
    #[serde(default = "default_true")]
    pub reap_orphans: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            image: default_image(),
            pull_missing_image: false,
            reap_orphans: true,
        }
    }
}

fn default_image() -> String {
    "fluence-dart-sandbox".to_string()
}

fn default_true() -> bool {
    true
}

/// Process jail (bubblewrap) configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSandboxConfig {
    /// Explicit path to `bwrap` (default: looked up in PATH)
    pub bwrap_path: Option<PathBuf>,
    /// Extra host directories bound read-only into the jail (toolchains)
    #[serde(default)]
    pub ro_binds: Vec<PathBuf>,
    /// Delegated cgroup v2 directory; each sandbox gets a child cgroup
    pub cgroup_parent: Option<PathBuf>,
    /// RLIMIT_AS in megabytes when no cgroup is configured (default: the
    /// memory limit). VM runtimes reserve far more address space than they
    /// touch and usually need this raised.
    #[serde(default)]
    pub address_space_limit_mb: Option<u64>,
}
