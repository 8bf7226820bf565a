//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors raised at the container runtime boundary.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime CLI invocation failed or exited non-zero.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to parse runtime output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// A config field failed validation before reaching the CLI.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    pub(crate) fn failed(command: &str, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            message: message.into(),
        }
    }
}
