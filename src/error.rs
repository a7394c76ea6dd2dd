//! Error types for Fluence Runner

use thiserror::Error;

/// Result type alias using Fluence Runner's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Fluence Runner
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Workspace provisioning error
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Sandbox (jail/process) error
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is a client error (caller's fault, nothing was provisioned)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }

    /// Check if error comes from the isolation layer rather than a bug or bad config
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::Workspace(_) | Error::Sandbox(_) | Error::Container(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::InvalidInput("empty".into()).is_client_error());
        assert!(!Error::InvalidInput("empty".into()).is_infrastructure());
        assert!(Error::Container("daemon down".into()).is_infrastructure());
        assert!(Error::Workspace("disk full".into()).is_infrastructure());
        assert!(!Error::Config("bad".into()).is_infrastructure());
        assert!(!Error::Internal("panicked".into()).is_infrastructure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Sandbox("bwrap not found".to_string());
        assert_eq!(err.to_string(), "Sandbox error: bwrap not found");
    }
}
