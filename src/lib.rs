//! # Fluence Runner
//!
//! Sandboxed execution engine for untrusted code submissions.
//!
//! ## Features
//!
//! - **Isolated Execution:** Ephemeral Docker containers or a bubblewrap jail,
//!   read-only workspace, no network, unprivileged user, no capabilities
//! - **Hard Limits:** Memory cap, CPU quota and a wall-clock deadline enforced
//!   by a watchdog kill
//! - **Typed Outcomes:** Success, runtime failure, timeout or infrastructure
//!   error, with every allocated resource reclaimed on every path

pub mod config;
pub mod error;
pub mod sandbox;

pub use config::Config;
pub use error::{Error, Result};
pub use sandbox::{Engine, ExecutionOutcome, ExecutionRequest, ExecutionResponse};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
