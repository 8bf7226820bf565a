//! Container runtime management module.
//!
//! Provides an async interface to manage session containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{
    Container, ContainerConfig, ContainerState, MountSpec, PortMapping, ResourceLimits,
};
pub use container::{validate_container_id_or_name, validate_image_name};
pub use error::{ContainerError, ContainerResult};

use container::{parse_container_list, validate_env_var_key};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    #[default]
    Podman,
}

impl RuntimeType {
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether bind mounts need SELinux relabel options.
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeType::Podman)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Result of a one-shot exec: stdout followed by stderr in a single buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Container runtime abstraction. The session layer only depends on this
/// contract, which keeps it testable without a daemon.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    /// List containers, optionally filtered by a `key=value` label. Only
    /// running containers unless `all` is set.
    async fn list_containers(
        &self,
        label_filter: Option<&str>,
        all: bool,
    ) -> ContainerResult<Vec<Container>>;
    /// Run a one-shot process inside a running container.
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> ContainerResult<ExecOutput>;
    /// Commit a container's filesystem to `image_ref`, returning the image id.
    async fn commit(&self, container_id: &str, image_ref: &str) -> ContainerResult<String>;
}

/// Container runtime client driving the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a runtime with auto-detection.
    ///
    /// Prefers Docker on macOS and Podman elsewhere, falling back to whichever
    /// binary is on PATH.
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self::with_type(RuntimeType::Docker);
            }
        }

        if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else {
            // Will fail on first use with a clear CLI error.
            Self::with_type(RuntimeType::Podman)
        }
    }

    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime CLI and return raw output, failing on spawn errors only.
    async fn run_raw(&self, command: &str, args: &[String]) -> ContainerResult<std::process::Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::failed(command, e.to_string()))
    }

    /// Run the runtime CLI, failing on non-zero exit, returning trimmed stdout.
    async fn run(&self, command: &str, args: Vec<String>) -> ContainerResult<String> {
        let output = self.run_raw(command, &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(command, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.run(
            "version",
            vec!["version".into(), "--format".into(), "json".into()],
        )
        .await
    }

    /// Build the argument vector for `create`.
    pub fn create_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["create".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref hostname) = config.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }

        if let Some(ref network) = config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for port in &config.ports {
            args.push("-p".to_string());
            args.push(format!(
                "{}:{}:{}",
                port.host_ip, port.host_port, port.container_port
            ));
        }

        for port in &config.expose {
            args.push("--expose".to_string());
            args.push(port.to_string());
        }

        for mount in &config.mounts {
            args.push("-v".to_string());
            let mode = match (mount.read_only, self.runtime_type.needs_selinux_labels()) {
                (true, true) => ":ro,z",
                (false, true) => ":z",
                (true, false) => ":ro",
                (false, false) => "",
            };
            args.push(format!(
                "{}:{}{}",
                mount.host_path, mount.container_path, mode
            ));
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        if let Some(ref user) = config.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }

        if let Some(ref memory) = config.limits.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }

        if let Some(ref cpus) = config.limits.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.clone());
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }
}

fn ps_args(label_filter: Option<&str>, all: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["ps".into(), "--format".into(), "json".into()];
    if all {
        args.push("-a".to_string());
    }
    if let Some(filter) = label_filter {
        args.push("--filter".to_string());
        args.push(format!("label={}", filter));
    }
    args
}

/// Map well-known CLI failures to typed errors.
fn classify_failure(command: &str, stderr: &str) -> ContainerError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no container with name or id") {
        ContainerError::ContainerNotFound(stderr.to_string())
    } else if lower.contains("no such image")
        || lower.contains("image not known")
        || lower.contains("manifest unknown")
        || lower.contains("pull access denied")
    {
        ContainerError::ImageNotFound(stderr.to_string())
    } else {
        ContainerError::failed(command, stderr)
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let args = self.create_args(config);
        self.run("create", args).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run("start", vec!["start".into(), container_id.into()])
            .await
            .map(|_| ())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run("stop", args).await.map(|_| ())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        self.run("rm", args).await.map(|_| ())
    }

    async fn list_containers(
        &self,
        label_filter: Option<&str>,
        all: bool,
    ) -> ContainerResult<Vec<Container>> {
        let args = ps_args(label_filter, all);
        let stdout = self.run("ps", args).await?;
        parse_container_list(&stdout)
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> ContainerResult<ExecOutput> {
        validate_container_id_or_name(container_id)?;
        if argv.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec requires a command".to_string(),
            ));
        }

        let mut args: Vec<String> = vec!["exec".to_string()];
        for (key, value) in env {
            validate_env_var_key(key)?;
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(container_id.to_string());
        args.extend(argv.iter().cloned());

        let output = self.run_raw("exec", &args).await?;
        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecOutput {
            exit_code: output.status.code(),
            output: merged,
        })
    }

    async fn commit(&self, container_id: &str, image_ref: &str) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;
        validate_image_name(image_ref)?;
        self.run(
            "commit",
            vec!["commit".into(), container_id.into(), image_ref.into()],
        )
        .await
    }
}
