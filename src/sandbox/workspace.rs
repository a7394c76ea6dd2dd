//! Workspace provisioning
//!
//! Every request gets its own directory with a random name, created with
//! owner-only permissions. After the files are written the directory is
//! opened up to read/traverse (never write) so the unprivileged sandbox
//! user can read it through the read-only mount.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::sandbox::types::ExecutionRequest;

const DIR_PREFIX: &str = "fluence-";

/// Ephemeral directory holding `main.<ext>` and optionally `test.<ext>`
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    main_file: String,
    test_file: Option<String>,
}

impl Workspace {
    /// Host path of the workspace directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the main program
    pub fn main_file(&self) -> &str {
        &self.main_file
    }

    /// File name of the test script, if one was submitted
    pub fn test_file(&self) -> Option<&str> {
        self.test_file.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }

    /// Delete the directory. Calling again after success is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                dir.close().map_err(|e| {
                    Error::Workspace(format!(
                        "Failed to remove workspace {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                debug!("Removed workspace {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Creates workspaces under a root directory
#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
    extension: String,
}

impl WorkspaceProvisioner {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        WorkspaceProvisioner {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        let root = config
            .workspace_root
            .clone()
            .unwrap_or_else(crate::config::workspace_root);
        Self::new(root, config.runtime.file_extension.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Materialize the request's files in a fresh workspace
    pub async fn provision(&self, request: &ExecutionRequest) -> Result<Workspace> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::Workspace(format!(
                "Failed to create workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .rand_bytes(16)
            .tempdir_in(&self.root)
            .map_err(|e| Error::Workspace(format!("Failed to create workspace: {}", e)))?;

        // From here on, dropping `workspace` removes the directory.
        let mut workspace = Workspace {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
            main_file: format!("main.{}", self.extension),
            test_file: request.test_script().map(|_| format!("test.{}", self.extension)),
        };

        write_file(&workspace.path, &workspace.main_file, request.source_code()).await?;
        if let (Some(name), Some(script)) = (&workspace.test_file, request.test_script()) {
            write_file(&workspace.path, name, script).await?;
        }

        if let Err(e) =
            tokio::fs::set_permissions(&workspace.path, std::fs::Permissions::from_mode(0o755)).await
        {
            if let Err(close_err) = workspace.close() {
                warn!("{}", close_err);
            }
            return Err(Error::Workspace(format!(
                "Failed to set workspace permissions: {}",
                e
            )));
        }

        debug!(
            "Provisioned workspace {} (test script: {})",
            workspace.path.display(),
            workspace.test_file.is_some()
        );

        Ok(workspace)
    }
}

async fn write_file(dir: &Path, name: &str, content: &str) -> Result<()> {
    let path = dir.join(name);
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| Error::Workspace(format!("Failed to write {}: {}", name, e)))?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
        .await
        .map_err(|e| Error::Workspace(format!("Failed to set permissions on {}: {}", name, e)))?;
    Ok(())
}
