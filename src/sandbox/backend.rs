//! Isolation backend abstraction
//!
//! A backend turns a [`Workspace`] plus [`ExecutionConstraints`] into a
//! [`Sandbox`]: an isolated environment that can be started, waited on,
//! killed from another task, drained of output, and destroyed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::sandbox::types::ExecutionConstraints;
use crate::sandbox::workspace::Workspace;

/// Mount point of the workspace inside every sandbox
pub const WORKSPACE_MOUNT: &str = "/app";

/// Marker appended to a stream that hit the capture cap
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Trait for isolation backends
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Create (but do not start) an isolated environment bound to `workspace`.
    ///
    /// The workspace must be mounted read-only, with networking disabled,
    /// an unprivileged identity and the memory/CPU caps in `constraints`.
    async fn create_sandbox(
        &self,
        workspace: &Workspace,
        constraints: &ExecutionConstraints,
    ) -> Result<Box<dyn Sandbox>>;

    /// Number of environments created and not yet destroyed
    fn live_sandboxes(&self) -> usize;
}

/// Handle to one isolated environment. Never shared between requests.
#[async_trait]
pub trait Sandbox: Send {
    /// Backend-specific identifier (container name, process group)
    fn id(&self) -> &str;

    /// Launch the program
    async fn start(&mut self) -> Result<()>;

    /// Wait for the program to exit and return its exit code
    async fn wait(&mut self) -> Result<i64>;

    /// A handle that can force-terminate the environment from any task
    fn kill_switch(&self) -> Arc<dyn KillSwitch>;

    /// Everything captured from stdout/stderr so far
    async fn collect_output(&mut self) -> Result<CapturedOutput>;

    /// Whether the backend killed the program for exceeding its memory cap
    async fn memory_exceeded(&mut self) -> bool {
        false
    }

    /// Tear the environment down. Safe to call more than once.
    async fn destroy(&mut self) -> Result<()>;
}

/// Forced termination, usable concurrently with [`Sandbox::wait`]
#[async_trait]
pub trait KillSwitch: Send + Sync {
    /// Send an unconditional kill. Killing an already-dead sandbox is Ok.
    async fn kill(&self) -> Result<()>;
}

/// Captured output streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Argument vector for the fixed run protocol.
///
/// With a test script: run it, and run the main program only if it exits 0.
/// Otherwise run the main program alone. File names travel as positional
/// shell parameters, never spliced into the script.
pub fn launch_command(interpreter: &str, main_file: &str, test_file: Option<&str>) -> Vec<String> {
    match test_file {
        Some(test) => vec![
            "sh".to_string(),
            "-c".to_string(),
            "\"$0\" \"$1\" && \"$0\" \"$2\"".to_string(),
            interpreter.to_string(),
            test.to_string(),
            main_file.to_string(),
        ],
        None => vec![interpreter.to_string(), main_file.to_string()],
    }
}

/// Counts environments that hold host resources
#[derive(Debug, Default)]
pub struct ResourceTracker {
    live: AtomicUsize,
}

impl ResourceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(ResourceTracker::default())
    }

    /// Record a newly allocated environment
    pub fn acquire(self: &Arc<Self>) -> LiveToken {
        self.live.fetch_add(1, Ordering::SeqCst);
        LiveToken {
            tracker: Arc::clone(self),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Proof that one environment is allocated.
///
/// Released explicitly once teardown succeeded. Dropping the token without
/// releasing it keeps the environment counted as leaked.
#[derive(Debug)]
pub struct LiveToken {
    tracker: Arc<ResourceTracker>,
}

impl LiveToken {
    pub fn release(self) {
        self.tracker.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Byte buffer with a hard cap; bytes beyond the cap are dropped
#[derive(Debug, Default)]
pub(crate) struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        CaptureBuffer {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Take the contents as text, leaving the buffer empty
    pub(crate) fn take_string(&mut self) -> String {
        let mut text = String::from_utf8_lossy(&std::mem::take(&mut self.data)).into_owned();
        if std::mem::take(&mut self.truncated) {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}
