//! Backends for tests: the same process-group sandbox without a jail, plus
//! one that always fails.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::sandbox::backend::{launch_command, IsolationBackend, ResourceTracker, Sandbox};
use crate::sandbox::process::ProcessSandbox;
use crate::sandbox::types::ExecutionConstraints;
use crate::sandbox::workspace::Workspace;

/// Runs programs with the host `sh` in the workspace directory
pub struct HostShellBackend {
    tracker: Arc<ResourceTracker>,
}

impl HostShellBackend {
    pub fn new() -> Self {
        HostShellBackend {
            tracker: ResourceTracker::new(),
        }
    }
}

#[async_trait]
impl IsolationBackend for HostShellBackend {
    fn name(&self) -> &str {
        "host-shell"
    }

    async fn create_sandbox(
        &self,
        workspace: &Workspace,
        constraints: &ExecutionConstraints,
    ) -> Result<Box<dyn Sandbox>> {
        let argv = launch_command("sh", workspace.main_file(), workspace.test_file());
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(workspace.path());

        Ok(Box::new(ProcessSandbox::new(
            format!("host-{}", uuid::Uuid::new_v4().simple()),
            command,
            constraints.max_output_bytes(),
            None,
            self.tracker.acquire(),
        )))
    }

    fn live_sandboxes(&self) -> usize {
        self.tracker.live()
    }
}

/// A backend whose runtime is unreachable
pub struct UnavailableBackend;

#[async_trait]
impl IsolationBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn create_sandbox(
        &self,
        _workspace: &Workspace,
        _constraints: &ExecutionConstraints,
    ) -> Result<Box<dyn Sandbox>> {
        Err(Error::Container(
            "Failed to create container: connection refused (/var/run/docker.sock)".to_string(),
        ))
    }

    fn live_sandboxes(&self) -> usize {
        0
    }
}
