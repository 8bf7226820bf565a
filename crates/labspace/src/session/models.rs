//! Session data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::apps::ConfigError;

/// Application wrapped by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Operations,
    Rstudio,
    Jupyter,
    Vscode,
}

impl AppType {
    pub const ALL: [AppType; 4] = [
        AppType::Operations,
        AppType::Rstudio,
        AppType::Jupyter,
        AppType::Vscode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Operations => "operations",
            AppType::Rstudio => "rstudio",
            AppType::Jupyter => "jupyter",
            AppType::Vscode => "vscode",
        }
    }

    /// Sessions whose lifetime is tied to the owner's control connection.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, AppType::Operations)
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "operations" => Ok(AppType::Operations),
            "rstudio" => Ok(AppType::Rstudio),
            "jupyter" => Ok(AppType::Jupyter),
            "vscode" | "code-server" => Ok(AppType::Vscode),
            _ => Err(ConfigError::UnknownAppType(s.to_string())),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Token and port allocated, no container yet.
    Pending,
    /// Container create/start issued.
    Starting,
    /// Readiness check succeeded.
    Ready,
    /// Proxy registered, traffic flows.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Terminal.
    Stopped,
}

impl SessionStatus {
    /// Whether the session still occupies its (owner, project, app) slot.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, SessionStatus::Stopping | SessionStatus::Stopped)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Ready => "ready",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    #[serde(rename = "ro", alias = "read-only", alias = "readonly")]
    ReadOnly,
    #[serde(rename = "rw", alias = "read-write", alias = "readwrite")]
    ReadWrite,
}

impl MountMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, MountMode::ReadOnly)
    }
}

/// Volume binding of a session. Immutable once the session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub mode: MountMode,
}

impl VolumeMount {
    pub fn read_write(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadWrite,
        }
    }

    pub fn read_only(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadOnly,
        }
    }
}

/// Volume binding as supplied by a caller; the mode may be left out.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeRequest {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub mode: Option<MountMode>,
}

impl VolumeRequest {
    /// Resolve missing modes: the first volume is the project volume and is
    /// writable, every other volume is reference material and read-only.
    pub fn resolve(requests: Vec<VolumeRequest>) -> Vec<VolumeMount> {
        requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| {
                let default = if index == 0 {
                    MountMode::ReadWrite
                } else {
                    MountMode::ReadOnly
                };
                VolumeMount {
                    host_path: request.host_path,
                    container_path: request.container_path,
                    mode: request.mode.unwrap_or(default),
                }
            })
            .collect()
    }
}

/// Caller identity, established upstream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Serializable snapshot of a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub access_code: String,
    pub owner: String,
    pub project: String,
    pub app_type: AppType,
    pub proxy_port: u16,
    pub container_id: Option<String>,
    pub status: SessionStatus,
    pub image: String,
    pub volumes: Vec<VolumeMount>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a session teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStatus {
    Ok,
    Error,
}

impl DeleteStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DeleteStatus::Ok)
    }
}
