//! Docker container-based execution
//!
//! Each execution gets an ephemeral container with the workspace bind
//! mounted read-only at `/app`, a read-only root filesystem, no network,
//! uid/gid 65534, all capabilities dropped and hard memory/CPU/pids caps.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{ContainerConfig, RuntimeConfig, SandboxConfig};
use crate::error::{Error, Result};
use crate::sandbox::backend::{
    launch_command, CaptureBuffer, CapturedOutput, IsolationBackend, KillSwitch, LiveToken,
    ResourceTracker, Sandbox, WORKSPACE_MOUNT,
};
use crate::sandbox::types::ExecutionConstraints;
use crate::sandbox::workspace::Workspace;

/// Label put on every container this service creates
pub const MANAGED_LABEL: &str = "fluence-runner.managed";

/// Process-wide Docker client, connected and pinged on first use
static DOCKER: OnceCell<Docker> = OnceCell::const_new();

/// Get the shared Docker client.
///
/// Initialized at most once; concurrent first callers wait on the same
/// initialization. `Docker` is a cheap, thread-safe handle.
pub async fn docker_client() -> Result<&'static Docker> {
    DOCKER
        .get_or_try_init(|| async {
            let docker = Docker::connect_with_local_defaults()
                .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;

            docker
                .ping()
                .await
                .map_err(|e| Error::Container(format!("Docker ping failed: {}", e)))?;

            info!("Connected to Docker");
            Ok(docker)
        })
        .await
}

/// Docker container backend
pub struct ContainerExecutor {
    /// Docker client
    docker: Docker,
    /// Container configuration
    config: ContainerConfig,
    runtime: RuntimeConfig,
    tracker: Arc<ResourceTracker>,
}

impl ContainerExecutor {
    /// Create a new container backend.
    ///
    /// Fails when the configured sandbox image is unavailable; there is no
    /// fallback to a different image.
    pub async fn new(config: &SandboxConfig) -> Result<Self> {
        let docker = docker_client().await?.clone();

        let executor = ContainerExecutor {
            docker,
            config: config.container.clone(),
            runtime: config.runtime.clone(),
            tracker: ResourceTracker::new(),
        };

        executor.ensure_image().await?;

        if executor.config.reap_orphans {
            executor.reap_orphans().await;
        }

        Ok(executor)
    }

    /// Ensure the sandbox image is present, pulling it only when allowed
    async fn ensure_image(&self) -> Result<()> {
        let image = &self.config.image;

        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Sandbox image {} present", image);
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(Error::Container(format!(
                    "Failed to inspect image {}: {}",
                    image, e
                )))
            }
        }

        if !self.config.pull_missing_image {
            return Err(Error::Container(format!(
                "Sandbox image {} not found and pulling is disabled; refusing to run",
                image
            )));
        }

        info!("Pulling Docker image: {}", image);

        let options = CreateImageOptions {
            from_image: image.clone(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::Container(format!("Failed to pull image: {}", e)));
                }
            }
        }

        info!("Image pulled successfully");
        Ok(())
    }

    /// Remove labelled containers left behind by a crashed process
    async fn reap_orphans(&self) {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = match self.docker.list_containers(Some(options)).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Failed to list orphaned containers: {}", e);
                return;
            }
        };

        for id in containers.into_iter().filter_map(|c| c.id) {
            match remove_container(&self.docker, &id).await {
                Ok(()) => info!("Removed orphaned container {}", id),
                Err(e) => warn!("Failed to remove orphaned container {}: {}", id, e),
            }
        }
    }

    /// Container configuration for one execution
    fn container_spec(
        &self,
        workspace: &Workspace,
        constraints: &ExecutionConstraints,
    ) -> Config<String> {
        let cmd = launch_command(
            &self.runtime.interpreter,
            workspace.main_file(),
            workspace.test_file(),
        );

        let memory = i64::try_from(constraints.memory_limit_bytes()).unwrap_or(i64::MAX);
        let nano_cpus = (constraints.cpu_quota() * 1_000_000_000.0) as i64;

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(cmd),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            user: Some("65534:65534".to_string()),
            env: Some(vec![format!("HOME={}", WORKSPACE_MOUNT)]),
            network_disabled: Some(true),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:ro",
                    workspace.path().display(),
                    WORKSPACE_MOUNT
                )]),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(i64::from(constraints.pids_limit())),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                auto_remove: Some(false), // We'll remove manually after getting logs
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerExecutor {
    fn name(&self) -> &str {
        "container"
    }

    async fn create_sandbox(
        &self,
        workspace: &Workspace,
        constraints: &ExecutionConstraints,
    ) -> Result<Box<dyn Sandbox>> {
        let name = format!("fluence-exec-{}", uuid::Uuid::new_v4());
        let spec = self.container_spec(workspace, constraints);

        let create_options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(create_options), spec)
            .await
            .map_err(|e| Error::Container(format!("Failed to create container: {}", e)))?;

        debug!("Created container: {}", name);

        Ok(Box::new(ContainerSandbox {
            docker: self.docker.clone(),
            name,
            max_output: constraints.max_output_bytes(),
            token: Some(self.tracker.acquire()),
        }))
    }

    fn live_sandboxes(&self) -> usize {
        self.tracker.live()
    }
}

/// One ephemeral container
struct ContainerSandbox {
    docker: Docker,
    name: String,
    max_output: usize,
    token: Option<LiveToken>,
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn id(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        self.docker
            .start_container(&self.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Container(format!("Failed to start container: {}", e)))
    }

    async fn wait(&mut self) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(&self.name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Container(format!("Wait failed: {}", e))),
            None => Err(Error::Container("Container wait stream ended".to_string())),
        }
    }

    fn kill_switch(&self) -> Arc<dyn KillSwitch> {
        Arc::new(ContainerKill {
            docker: self.docker.clone(),
            name: self.name.clone(),
        })
    }

    async fn collect_output(&mut self) -> Result<CapturedOutput> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(&self.name, Some(options));

        let mut stdout = CaptureBuffer::new(self.max_output);
        let mut stderr = CaptureBuffer::new(self.max_output);

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                Ok(_) => {}
                Err(e) => {
                    warn!("Error reading logs: {}", e);
                    break;
                }
            }
        }

        Ok(CapturedOutput {
            stdout: stdout.take_string(),
            stderr: stderr.take_string(),
        })
    }

    async fn memory_exceeded(&mut self) -> bool {
        match self
            .docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!("Failed to inspect container {}: {}", self.name, e);
                false
            }
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.token.is_none() {
            return Ok(());
        }

        remove_container(&self.docker, &self.name).await?;

        if let Some(token) = self.token.take() {
            token.release();
        }
        debug!("Removed container: {}", self.name);
        Ok(())
    }
}

impl Drop for ContainerSandbox {
    fn drop(&mut self) {
        // Reached without destroy() only on a panic path
        if self.token.is_some() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let docker = self.docker.clone();
                let name = self.name.clone();
                let token = self.token.take();
                handle.spawn(async move {
                    match remove_container(&docker, &name).await {
                        Ok(()) => {
                            if let Some(token) = token {
                                token.release();
                            }
                        }
                        Err(e) => warn!("Failed to remove container {}: {}", name, e),
                    }
                });
            }
        }
    }
}

/// SIGKILLs a container
struct ContainerKill {
    docker: Docker,
    name: String,
}

#[async_trait]
impl KillSwitch for ContainerKill {
    async fn kill(&self) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };

        match self.docker.kill_container(&self.name, Some(options)).await {
            Ok(()) => Ok(()),
            // Already exited or already gone
            Err(e) if is_not_found(&e) || is_conflict(&e) => Ok(()),
            Err(e) => Err(Error::Container(format!("Failed to kill container: {}", e))),
        }
    }
}

/// Force-remove a container; a missing container counts as removed
async fn remove_container(docker: &Docker, name: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    match docker.remove_container(name, Some(options)).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::Container(format!("Failed to remove container: {}", e))),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_conflict(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::ExecutionRequest;
    use crate::sandbox::workspace::WorkspaceProvisioner;
    use std::time::Duration;
    use tempfile::tempdir;

    fn executor_for_spec(config: &SandboxConfig) -> ContainerExecutor {
        // Connecting is lazy in bollard; no daemon is contacted here
        let docker =
            Docker::connect_with_http("http://localhost:2375", 4, bollard::API_DEFAULT_VERSION)
                .unwrap();
        ContainerExecutor {
            docker,
            config: config.container.clone(),
            runtime: config.runtime.clone(),
            tracker: ResourceTracker::new(),
        }
    }

    #[tokio::test]
    async fn test_container_spec_enforces_policy() {
        let config = SandboxConfig::default();
        let executor = executor_for_spec(&config);
        let constraints = ExecutionConstraints::from_config(&config).unwrap();

        let root = tempdir().unwrap();
        let request =
            ExecutionRequest::new("void main() {}", Some("void main() {}".to_string())).unwrap();
        let workspace = WorkspaceProvisioner::new(root.path(), "dart")
            .provision(&request)
            .await
            .unwrap();

        let spec = executor.container_spec(&workspace, &constraints);
        let host = spec.host_config.clone().unwrap();

        assert_eq!(spec.image.as_deref(), Some("fluence-dart-sandbox"));
        assert_eq!(spec.user.as_deref(), Some("65534:65534"));
        assert_eq!(spec.network_disabled, Some(true));
        assert_eq!(
            spec.cmd.unwrap(),
            launch_command("dart", "main.dart", Some("test.dart"))
        );
        assert_eq!(
            host.binds.unwrap(),
            vec![format!("{}:/app:ro", workspace.path().display())]
        );
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop.unwrap(), vec!["ALL"]);
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(
            spec.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon and the sandbox image"]
    async fn test_container_round_trip() {
        let mut config = SandboxConfig::default();
        config.container.image = "alpine:3".to_string();
        config.container.pull_missing_image = true;
        config.runtime.interpreter = "sh".to_string();
        config.runtime.file_extension = "sh".to_string();
        config.timeout = Duration::from_secs(10);

        let backend = ContainerExecutor::new(&config).await.unwrap();
        let constraints = ExecutionConstraints::from_config(&config).unwrap();

        let root = tempdir().unwrap();
        let request = ExecutionRequest::new(
            "id -u; touch /app/x 2>/dev/null || echo ro; wget -T 2 -q http://1.1.1.1 || echo offline",
            None,
        )
        .unwrap();
        let workspace = WorkspaceProvisioner::new(root.path(), "sh")
            .provision(&request)
            .await
            .unwrap();

        let mut sandbox = backend.create_sandbox(&workspace, &constraints).await.unwrap();
        sandbox.start().await.unwrap();
        assert_eq!(sandbox.wait().await.unwrap(), 0);
        let output = sandbox.collect_output().await.unwrap();
        sandbox.destroy().await.unwrap();

        assert_eq!(output.stdout, "65534\nro\noffline\n");
        assert_eq!(backend.live_sandboxes(), 0);
    }
}
