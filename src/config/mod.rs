//! Configuration module
//!
//! - types/mod.rs: Core configuration types (Config, ServerConfig, LogConfig)
//! - types/sandbox.rs: Sandbox/execution configuration
//! - io.rs: Configuration loading and env overrides
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{Config, LogConfig, LogFormat, ServerConfig};

// Re-export sandbox types
pub use types::sandbox::{
    ContainerConfig, ExecutionEnv, ProcessSandboxConfig, RuntimeConfig, SandboxConfig,
};

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path};
pub use paths::{config_dir, config_path, workspace_root};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
