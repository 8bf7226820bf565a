//! Container specification and listing types.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::error::{ContainerError, ContainerResult};

/// Published port. Sessions bind to loopback so the only way in is the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    pub fn loopback(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            host_port,
            container_port,
        }
    }
}

/// A bind mount in a container spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Resource ceilings passed through as `--memory` / `--cpus`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in runtime syntax, e.g. "4g".
    pub memory: Option<String>,
    /// CPU quota, e.g. "2" or "1.5".
    pub cpus: Option<String>,
}

/// Everything the runtime needs to create one session container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    /// Ordered so the generated CLI line is stable.
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Ports the application listens on inside the container (`--expose`).
    pub expose: Vec<u16>,
    pub mounts: Vec<MountSpec>,
    pub workdir: Option<String>,
    /// In-container identity (`--user`).
    pub user: Option<String>,
    pub network: Option<String>,
    pub limits: ResourceLimits,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate every field before it is turned into CLI arguments.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }
        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }
        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        for key in self.labels.keys() {
            validate_label_key(key)?;
        }
        for mount in &self.mounts {
            validate_volume_path(&mount.host_path, "host")?;
            validate_volume_path(&mount.container_path, "container")?;
            validate_container_path(&mount.container_path)?;
        }
        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }
        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports
            .push(PortMapping::loopback(host_port, container_port));
        self
    }

    pub fn expose(mut self, container_port: u16) -> Self {
        if !self.expose.contains(&container_port) {
            self.expose.push(container_port);
        }
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn mount(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
        read_only: bool,
    ) -> Self {
        self.mounts.push(MountSpec {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only,
        });
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Container state as reported by `ps`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One row of `ps --format json`.
///
/// Docker and podman disagree on field shapes: podman emits `Names` as a list
/// and `Labels` as a map, docker emits both as comma-separated strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub state: ContainerState,

    #[serde(default, deserialize_with = "deserialize_labels")]
    pub labels: HashMap<String, String>,
}

impl Container {
    /// Whether this row refers to `container_id`, tolerating short/long id forms.
    pub fn matches_id(&self, container_id: &str) -> bool {
        if self.id.is_empty() || container_id.is_empty() {
            return false;
        }
        self.id.starts_with(container_id) || container_id.starts_with(&self.id)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<StringOrList>::deserialize(deserializer)?;
    Ok(match raw {
        None => Vec::new(),
        Some(StringOrList::List(list)) => list,
        Some(StringOrList::String(text)) => text
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrMap {
    String(String),
    Map(HashMap<String, String>),
}

fn deserialize_labels<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<StringOrMap>::deserialize(deserializer)?;
    Ok(match raw {
        None => HashMap::new(),
        Some(StringOrMap::Map(map)) => map,
        Some(StringOrMap::String(text)) => parse_label_string(&text),
    })
}

/// Parse docker's `k=v,k2=v2` label rendering.
pub(crate) fn parse_label_string(text: &str) -> HashMap<String, String> {
    text.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Parse `ps --format json` output. Podman prints one JSON array, docker one
/// object per line.
pub(crate) fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Container>(line)
                .map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image reference: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container id or name passed to stop/start/exec/commit.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

fn validate_container_name(name: &str) -> ContainerResult<()> {
    validate_container_id_or_name(name)?;

    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    if !starts_ok {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    Ok(())
}

/// Hostnames follow RFC 1123: alphanumeric with hyphens, max 63 chars per label.
fn validate_hostname(hostname: &str) -> ContainerResult<()> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(ContainerError::InvalidInput(format!(
            "hostname '{}' has invalid length",
            hostname
        )));
    }

    for label in hostname.split('.') {
        let bytes = label.as_bytes();
        let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
            return Err(ContainerError::InvalidInput(
                "hostname cannot have empty labels".to_string(),
            ));
        };
        if label.len() > 63 || !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(ContainerError::InvalidInput(format!(
                "hostname label '{}' is invalid",
                label
            )));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ContainerError::InvalidInput(format!(
                "hostname '{}' contains invalid characters",
                hostname
            )));
        }
    }

    Ok(())
}

/// POSIX environment variable names.
pub(crate) fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let starts_ok = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || key.len() > 256 {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

/// Label keys use reverse-DNS style: alphanumeric plus `.`, `-`, `_`.
fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() || key.len() > 256 {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' has invalid length",
            key
        )));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    // ':' would be read as the mode separator of `-v`.
    let dangerous_chars = [
        '\0', ':', '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '*', '?', '\\',
        '"', '\'', '\n', '\r',
    ];
    if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path contains forbidden character {:?}",
            side, c
        )));
    }

    Ok(())
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }

    Ok(())
}
