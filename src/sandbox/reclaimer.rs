//! Resource reclamation
//!
//! Tears down the sandbox and then the workspace for every request on every
//! path. Failures are logged and never change the request's outcome.

use std::time::Duration;
use tracing::{debug, warn};

use crate::sandbox::backend::Sandbox;
use crate::sandbox::workspace::Workspace;

/// Upper bound on each teardown step
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// What reclamation managed to release
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub sandbox_released: bool,
    pub workspace_released: bool,
}

impl ReclaimReport {
    pub fn is_clean(&self) -> bool {
        self.sandbox_released && self.workspace_released
    }
}

/// Release whatever was allocated; absent resources count as released.
///
/// The sandbox goes first: it mounts the workspace.
pub async fn release(
    sandbox: &mut Option<Box<dyn Sandbox>>,
    workspace: &mut Option<Workspace>,
) -> ReclaimReport {
    let mut report = ReclaimReport::default();

    match sandbox.as_mut() {
        Some(sb) => match tokio::time::timeout(STEP_TIMEOUT, sb.destroy()).await {
            Ok(Ok(())) => {
                debug!("Released sandbox {}", sb.id());
                report.sandbox_released = true;
            }
            Ok(Err(e)) => warn!("Failed to destroy sandbox {}: {}", sb.id(), e),
            Err(_) => warn!("Timed out destroying sandbox {}", sb.id()),
        },
        None => report.sandbox_released = true,
    }
    if report.sandbox_released {
        *sandbox = None;
    }

    match workspace.as_mut() {
        Some(ws) => match ws.close() {
            Ok(()) => report.workspace_released = true,
            Err(e) => warn!("{}", e),
        },
        None => report.workspace_released = true,
    }
    if report.workspace_released {
        *workspace = None;
    }

    report
}
