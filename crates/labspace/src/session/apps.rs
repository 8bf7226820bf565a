//! Per-application container specifications.
//!
//! Each app type has a builder that fixes the image, the port the app listens
//! on inside the container, the working directory, the in-container identity
//! and the environment the app needs. The registry picks a builder through the
//! [`AppCatalog`].

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::container::{ContainerConfig, ResourceLimits};

use super::models::{AppType, UserIdentity, VolumeMount};

pub const LABEL_MANAGED: &str = "labspace.managed";
pub const LABEL_APP_TYPE: &str = "labspace.app-type";
pub const LABEL_OWNER: &str = "labspace.owner";
pub const LABEL_PROJECT: &str = "labspace.project";
pub const LABEL_ACCESS_CODE: &str = "labspace.access-code";

/// Label filter matching every container this service created.
pub fn managed_label_filter() -> String {
    format!("{}=true", LABEL_MANAGED)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown app type: {0}")]
    UnknownAppType(String),

    #[error("invalid session settings: {0}")]
    InvalidSettings(String),
}

/// Per-app settings from the `apps.<type>` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
}

impl AppSettings {
    pub fn defaults_for(app_type: AppType) -> Self {
        let image = match app_type {
            AppType::Operations => "ghcr.io/labspace/operations:latest",
            AppType::Rstudio => "docker.io/rocker/rstudio:latest",
            AppType::Jupyter => "quay.io/jupyter/base-notebook:latest",
            AppType::Vscode => "docker.io/codercom/code-server:latest",
        };
        Self {
            image: image.to_string(),
            memory: None,
            cpus: None,
        }
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory: self.memory.clone(),
            cpus: self.cpus.clone(),
        }
    }
}

/// Settings shared by every builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderContext {
    /// Prefix of container names, e.g. `labspace-`.
    pub name_prefix: String,
    /// Session network, if containers are attached to one.
    pub network: Option<String>,
}

impl Default for BuilderContext {
    fn default() -> Self {
        Self {
            name_prefix: "labspace-".to_string(),
            network: None,
        }
    }
}

/// Turns a user, a project and volume bindings into a container spec for one
/// application type.
pub trait SessionConfigBuilder: Send + Sync {
    fn app_type(&self) -> AppType;

    /// Port the application listens on inside the container.
    fn internal_port(&self) -> u16;

    /// Default image for this app.
    fn image(&self) -> &str;

    /// Default working directory inside the container.
    fn workdir(&self) -> &str;

    fn build_spec(
        &self,
        user: &UserIdentity,
        project: &str,
        access_code: &str,
        volumes: &[VolumeMount],
    ) -> Result<ContainerConfig, ConfigError>;
}

/// Container name for a session.
pub fn container_name(prefix: &str, app_type: AppType, access_code: &str) -> String {
    format!("{}{}-{}", prefix, app_type, access_code)
}

pub(crate) fn generate_secret(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Spec fields common to every app: identity labels, mounts, limits, naming.
fn base_spec(
    app_type: AppType,
    settings: &AppSettings,
    context: &BuilderContext,
    internal_port: u16,
    user: &UserIdentity,
    project: &str,
    access_code: &str,
    volumes: &[VolumeMount],
) -> Result<ContainerConfig, ConfigError> {
    if user.id.trim().is_empty() {
        return Err(ConfigError::InvalidSettings(
            "owner id cannot be empty".to_string(),
        ));
    }
    if project.trim().is_empty() {
        return Err(ConfigError::InvalidSettings(
            "project id cannot be empty".to_string(),
        ));
    }
    if access_code.is_empty() {
        return Err(ConfigError::InvalidSettings(
            "access code cannot be empty".to_string(),
        ));
    }
    if settings.image.trim().is_empty() {
        return Err(ConfigError::InvalidSettings(format!(
            "no image configured for {}",
            app_type
        )));
    }

    let mut spec = ContainerConfig::new(settings.image.clone())
        .name(container_name(&context.name_prefix, app_type, access_code))
        .hostname(format!("{}-{}", app_type, access_code))
        .network(context.network.clone())
        .expose(internal_port)
        .label(LABEL_MANAGED, "true")
        .label(LABEL_APP_TYPE, app_type.as_str())
        .label(LABEL_OWNER, user.id.clone())
        .label(LABEL_PROJECT, project)
        .label(LABEL_ACCESS_CODE, access_code)
        .limits(settings.limits());

    for volume in volumes {
        spec = spec.mount(
            volume.host_path.clone(),
            volume.container_path.clone(),
            volume.mode.is_read_only(),
        );
    }

    Ok(spec)
}

/// Privileged operations agent.
#[derive(Debug, Clone)]
pub struct OperationsBuilder {
    settings: AppSettings,
    context: BuilderContext,
}

impl OperationsBuilder {
    pub const PORT: u16 = 8000;
    const WORKDIR: &'static str = "/workspace";

    pub fn new(settings: AppSettings, context: BuilderContext) -> Self {
        Self { settings, context }
    }
}

impl SessionConfigBuilder for OperationsBuilder {
    fn app_type(&self) -> AppType {
        AppType::Operations
    }

    fn internal_port(&self) -> u16 {
        Self::PORT
    }

    fn image(&self) -> &str {
        &self.settings.image
    }

    fn workdir(&self) -> &str {
        Self::WORKDIR
    }

    fn build_spec(
        &self,
        user: &UserIdentity,
        project: &str,
        access_code: &str,
        volumes: &[VolumeMount],
    ) -> Result<ContainerConfig, ConfigError> {
        let spec = base_spec(
            self.app_type(),
            &self.settings,
            &self.context,
            Self::PORT,
            user,
            project,
            access_code,
            volumes,
        )?;

        Ok(spec
            .user("root")
            .workdir(Self::WORKDIR)
            .env("SERVICE_PASSWORD", generate_secret(24))
            .env("ACCESS_CODE", access_code)
            .env("OWNER_ID", user.id.clone())
            .env("PROJECT_ID", project)
            .env("PORT", Self::PORT.to_string()))
    }
}

/// RStudio Server (rocker images). The init system runs as root and drops to
/// the `rstudio` account, so no `--user` is set.
#[derive(Debug, Clone)]
pub struct RStudioBuilder {
    settings: AppSettings,
    context: BuilderContext,
}

impl RStudioBuilder {
    pub const PORT: u16 = 8787;
    const WORKDIR: &'static str = "/home/rstudio";

    pub fn new(settings: AppSettings, context: BuilderContext) -> Self {
        Self { settings, context }
    }
}

impl SessionConfigBuilder for RStudioBuilder {
    fn app_type(&self) -> AppType {
        AppType::Rstudio
    }

    fn internal_port(&self) -> u16 {
        Self::PORT
    }

    fn image(&self) -> &str {
        &self.settings.image
    }

    fn workdir(&self) -> &str {
        Self::WORKDIR
    }

    fn build_spec(
        &self,
        user: &UserIdentity,
        project: &str,
        access_code: &str,
        volumes: &[VolumeMount],
    ) -> Result<ContainerConfig, ConfigError> {
        let spec = base_spec(
            self.app_type(),
            &self.settings,
            &self.context,
            Self::PORT,
            user,
            project,
            access_code,
            volumes,
        )?;

        Ok(spec
            .workdir(Self::WORKDIR)
            .env("USER", "rstudio")
            .env("PASSWORD", generate_secret(24))
            .env("DISABLE_AUTH", "true"))
    }
}

/// Jupyter server; the access code doubles as the server token.
#[derive(Debug, Clone)]
pub struct JupyterBuilder {
    settings: AppSettings,
    context: BuilderContext,
}

impl JupyterBuilder {
    pub const PORT: u16 = 8888;
    const WORKDIR: &'static str = "/home/jovyan/work";

    pub fn new(settings: AppSettings, context: BuilderContext) -> Self {
        Self { settings, context }
    }
}

impl SessionConfigBuilder for JupyterBuilder {
    fn app_type(&self) -> AppType {
        AppType::Jupyter
    }

    fn internal_port(&self) -> u16 {
        Self::PORT
    }

    fn image(&self) -> &str {
        &self.settings.image
    }

    fn workdir(&self) -> &str {
        Self::WORKDIR
    }

    fn build_spec(
        &self,
        user: &UserIdentity,
        project: &str,
        access_code: &str,
        volumes: &[VolumeMount],
    ) -> Result<ContainerConfig, ConfigError> {
        let spec = base_spec(
            self.app_type(),
            &self.settings,
            &self.context,
            Self::PORT,
            user,
            project,
            access_code,
            volumes,
        )?;

        Ok(spec
            .user("jovyan")
            .workdir(Self::WORKDIR)
            .env("JUPYTER_TOKEN", access_code)
            .env("JUPYTER_PORT", Self::PORT.to_string())
            .env("NB_USER", "jovyan"))
    }
}

/// code-server under its fixed `coder` service account.
#[derive(Debug, Clone)]
pub struct VsCodeBuilder {
    settings: AppSettings,
    context: BuilderContext,
}

impl VsCodeBuilder {
    pub const PORT: u16 = 8080;
    const WORKDIR: &'static str = "/home/coder/project";
    const SERVICE_ACCOUNT: &'static str = "coder";

    pub fn new(settings: AppSettings, context: BuilderContext) -> Self {
        Self { settings, context }
    }
}

impl SessionConfigBuilder for VsCodeBuilder {
    fn app_type(&self) -> AppType {
        AppType::Vscode
    }

    fn internal_port(&self) -> u16 {
        Self::PORT
    }

    fn image(&self) -> &str {
        &self.settings.image
    }

    fn workdir(&self) -> &str {
        Self::WORKDIR
    }

    fn build_spec(
        &self,
        user: &UserIdentity,
        project: &str,
        access_code: &str,
        volumes: &[VolumeMount],
    ) -> Result<ContainerConfig, ConfigError> {
        let spec = base_spec(
            self.app_type(),
            &self.settings,
            &self.context,
            Self::PORT,
            user,
            project,
            access_code,
            volumes,
        )?;

        let workdir = volumes
            .first()
            .map(|v| v.container_path.clone())
            .unwrap_or_else(|| Self::WORKDIR.to_string());

        Ok(spec
            .user(Self::SERVICE_ACCOUNT)
            .workdir(Self::WORKDIR)
            .command([
                "--bind-addr".to_string(),
                format!("0.0.0.0:{}", Self::PORT),
                "--auth".to_string(),
                "none".to_string(),
                workdir,
            ]))
    }
}

/// Builder lookup by app type.
#[derive(Clone)]
pub struct AppCatalog {
    builders: HashMap<AppType, Arc<dyn SessionConfigBuilder>>,
}

impl AppCatalog {
    /// Catalog with a builder for every app type.
    pub fn new(apps: &HashMap<AppType, AppSettings>, context: BuilderContext) -> Self {
        let settings_for = |app: AppType| {
            apps.get(&app)
                .cloned()
                .unwrap_or_else(|| AppSettings::defaults_for(app))
        };

        let mut builders: HashMap<AppType, Arc<dyn SessionConfigBuilder>> = HashMap::new();
        builders.insert(
            AppType::Operations,
            Arc::new(OperationsBuilder::new(
                settings_for(AppType::Operations),
                context.clone(),
            )),
        );
        builders.insert(
            AppType::Rstudio,
            Arc::new(RStudioBuilder::new(
                settings_for(AppType::Rstudio),
                context.clone(),
            )),
        );
        builders.insert(
            AppType::Jupyter,
            Arc::new(JupyterBuilder::new(
                settings_for(AppType::Jupyter),
                context.clone(),
            )),
        );
        builders.insert(
            AppType::Vscode,
            Arc::new(VsCodeBuilder::new(settings_for(AppType::Vscode), context)),
        );

        Self { builders }
    }

    /// Catalog from an explicit builder set.
    pub fn from_builders(builders: Vec<Arc<dyn SessionConfigBuilder>>) -> Self {
        Self {
            builders: builders
                .into_iter()
                .map(|builder| (builder.app_type(), builder))
                .collect(),
        }
    }

    pub fn builder(&self, app_type: AppType) -> Result<Arc<dyn SessionConfigBuilder>, ConfigError> {
        self.builders
            .get(&app_type)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownAppType(app_type.to_string()))
    }

    /// Resolve a builder from a free-form app name.
    pub fn builder_for_name(
        &self,
        name: &str,
    ) -> Result<Arc<dyn SessionConfigBuilder>, ConfigError> {
        let app_type: AppType = name.parse()?;
        self.builder(app_type)
    }
}

impl Default for AppCatalog {
    fn default() -> Self {
        Self::new(&HashMap::new(), BuilderContext::default())
    }
}

impl std::fmt::Debug for AppCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut apps: Vec<_> = self.builders.keys().collect();
        apps.sort();
        f.debug_struct("AppCatalog").field("apps", &apps).finish()
    }
}
