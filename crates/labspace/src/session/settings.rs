use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::readiness::ReadinessSettings;

/// How the proxy reaches a session container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// App port published on `127.0.0.1:<proxy_port>`.
    #[default]
    Published,
    /// `<container-name>:<internal_port>` on the session network.
    Network,
}

/// Registry-wide session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Proxy ports handed out to sessions, end exclusive.
    pub port_range: Range<u16>,
    pub address_mode: AddressMode,
    /// In-container agent executable.
    pub agent_path: String,
    pub stop_timeout_seconds: u32,
    pub name_prefix: String,
    pub max_proxy_body_bytes: usize,
    pub readiness: ReadinessSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            port_range: 30000..31000,
            address_mode: AddressMode::Published,
            agent_path: "/usr/local/bin/labspace-agent".to_string(),
            stop_timeout_seconds: 10,
            name_prefix: "labspace-".to_string(),
            max_proxy_body_bytes: 100 * 1024 * 1024,
            readiness: ReadinessSettings::default(),
        }
    }
}
