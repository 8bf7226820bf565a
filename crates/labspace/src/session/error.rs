use std::time::Duration;

use thiserror::Error;

use crate::container::ContainerError;

use super::apps::ConfigError;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] ContainerError),

    #[error(
        "session {access_code} not ready after {attempts} attempts over {elapsed:?}"
    )]
    ReadinessTimeout {
        access_code: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} was already started")]
    AlreadyStarted(String),

    #[error("{0}")]
    Conflict(String),

    #[error("no free proxy port in the configured range")]
    PortsExhausted,

    #[error("session {0} has been deleted")]
    Deleted(String),
}
