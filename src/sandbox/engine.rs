//! Execution facade
//!
//! Wires provisioning, isolation, supervision, classification and
//! reclamation into one total operation. Every request runs in its own
//! detached task, so dropping the caller's future neither skips the kill
//! nor the cleanup.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::sandbox::backend::{IsolationBackend, Sandbox};
use crate::sandbox::classifier::{classify, classify_error};
use crate::sandbox::reclaimer;
use crate::sandbox::supervisor::Supervisor;
use crate::sandbox::types::{
    ExecutionConstraints, ExecutionOutcome, ExecutionRequest, ExecutionResponse, RawResult,
};
use crate::sandbox::workspace::{Workspace, WorkspaceProvisioner};

/// Sandboxed execution engine. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn IsolationBackend>,
    provisioner: WorkspaceProvisioner,
    constraints: ExecutionConstraints,
    supervisor: Supervisor,
    admission: Option<Arc<Semaphore>>,
}

impl Engine {
    /// Build the engine and its configured backend
    pub async fn from_config(config: &SandboxConfig) -> Result<Self> {
        let backend = crate::sandbox::create_backend(config).await?;
        let constraints = ExecutionConstraints::from_config(config)?;

        info!(
            "Execution engine ready: backend={}, timeout={:?}, memory={}MB, cpu={}",
            backend.name(),
            config.timeout,
            config.memory_limit_mb,
            config.cpu_quota
        );

        Ok(Self::new(backend, WorkspaceProvisioner::from_config(config), constraints)
            .with_max_concurrent(config.max_concurrent))
    }

    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        provisioner: WorkspaceProvisioner,
        constraints: ExecutionConstraints,
    ) -> Self {
        Engine {
            backend,
            provisioner,
            constraints,
            supervisor: Supervisor::default(),
            admission: None,
        }
    }

    /// Limit the number of concurrently running executions. 0 means unlimited.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.admission = (max > 0).then(|| Arc::new(Semaphore::new(max)));
        self
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn constraints(&self) -> &ExecutionConstraints {
        &self.constraints
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Environments currently holding host resources
    pub fn live_sandboxes(&self) -> usize {
        self.backend.live_sandboxes()
    }

    /// Run one request to a classified outcome. Never fails.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let engine = self.clone();
        let task = tokio::spawn(async move { engine.run(request).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => classify_error(&Error::Internal(format!("Execution task failed: {}", e)), 0),
        }
    }

    /// Validate raw input, execute it and map the outcome to the response shape.
    ///
    /// Empty source code is rejected before anything is provisioned.
    pub async fn execute_code(
        &self,
        source_code: &str,
        test_script: Option<&str>,
    ) -> Result<ExecutionResponse> {
        let request = ExecutionRequest::new(source_code, test_script.map(str::to_string))?;
        let outcome = self.execute(request).await;
        Ok(ExecutionResponse::from_outcome(
            &outcome,
            self.constraints.wall_clock_timeout(),
        ))
    }

    async fn run(self, request: ExecutionRequest) -> ExecutionOutcome {
        let _permit = match &self.admission {
            Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return classify_error(
                        &Error::Internal("Admission semaphore closed".to_string()),
                        0,
                    )
                }
            },
            None => None,
        };

        let started = Instant::now();
        let mut workspace = None;
        let mut sandbox = None;

        let result = AssertUnwindSafe(self.pipeline(&request, &mut workspace, &mut sandbox))
            .catch_unwind()
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(raw)) => classify(raw, duration_ms),
            Ok(Err(e)) => classify_error(&e, duration_ms),
            Err(_) => classify_error(
                &Error::Internal("Execution pipeline panicked".to_string()),
                duration_ms,
            ),
        };

        let report = reclaimer::release(&mut sandbox, &mut workspace).await;
        if !report.is_clean() {
            warn!("Incomplete cleanup after execution: {:?}", report);
        }

        info!(
            "Execution finished: outcome={}, duration={}ms, test_script={}",
            outcome.kind(),
            duration_ms,
            request.has_test()
        );
        outcome
    }

    /// Provision, create and supervise. Allocated resources are left in the
    /// slots for the reclaimer whether or not this returns early.
    async fn pipeline(
        &self,
        request: &ExecutionRequest,
        workspace: &mut Option<Workspace>,
        sandbox: &mut Option<Box<dyn Sandbox>>,
    ) -> Result<RawResult> {
        let ws = workspace.insert(self.provisioner.provision(request).await?);

        let sb = sandbox.insert(self.backend.create_sandbox(ws, &self.constraints).await?);
        debug!("Created sandbox {} on {}", sb.id(), self.backend.name());

        let deadline = Instant::now() + self.constraints.wall_clock_timeout();
        self.supervisor.run(sb.as_mut(), deadline).await
    }
}
