//! Sandbox module - Isolated execution of untrusted code
//!
//! Provides two isolation backends:
//! - Container Mode: Ephemeral Docker containers
//! - Process Mode: Bubblewrap jail with rlimits and an optional cgroup
//!
//! The [`Engine`] runs a request through provisioning, isolation,
//! supervision, classification and reclamation.

mod backend;
mod cgroup;
mod classifier;
mod container;
mod engine;
mod os_sandbox;
mod process;
mod reclaimer;
mod supervisor;
#[cfg(test)]
mod testing;
mod types;
mod workspace;

pub use backend::{
    launch_command, CapturedOutput, IsolationBackend, KillSwitch, LiveToken, ResourceTracker,
    Sandbox, TRUNCATION_MARKER, WORKSPACE_MOUNT,
};
pub use cgroup::Cgroup;
pub use classifier::{classify, classify_error};
pub use container::{docker_client, ContainerExecutor, MANAGED_LABEL};
pub use engine::Engine;
pub use os_sandbox::OsSandbox;
pub use process::ProcessSandbox;
pub use reclaimer::{release, ReclaimReport};
pub use supervisor::Supervisor;
pub use types::{
    timeout_message, ExecutionConstraints, ExecutionOutcome, ExecutionRequest, ExecutionResponse,
    RawResult, INFRASTRUCTURE_MESSAGE, KILLED_EXIT_CODE,
};
pub use workspace::{Workspace, WorkspaceProvisioner};

use std::sync::Arc;

use crate::config::{ExecutionEnv, SandboxConfig};
use crate::error::Result;

/// Create the isolation backend selected by the configuration.
///
/// Fails when the selected backend cannot enforce isolation on this host.
pub async fn create_backend(config: &SandboxConfig) -> Result<Arc<dyn IsolationBackend>> {
    match config.execution_env {
        ExecutionEnv::Container => {
            let backend = ContainerExecutor::new(config).await?;
            Ok(Arc::new(backend))
        }
        ExecutionEnv::Process => {
            let backend = OsSandbox::new(config)?;
            Ok(Arc::new(backend))
        }
    }
}
