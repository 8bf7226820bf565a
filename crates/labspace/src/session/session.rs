//! One session: one container, its readiness, its proxy and its teardown.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::container::{ContainerConfig, ContainerRuntimeApi};
use crate::proxy::{ProxyClient, SessionProxy};

use super::agent::{self, CommandOutput, KEYWORD_COPY_DOCS, KEYWORD_SAVE};
use super::apps::{SessionConfigBuilder, container_name};
use super::error::{SessionError, SessionResult};
use super::models::{
    AppType, DeleteStatus, SessionDescriptor, SessionStatus, UserIdentity, VolumeMount,
};
use super::readiness::SessionReadiness;
use super::registry::SessionTable;
use super::settings::{AddressMode, SessionSettings};

/// Registry-wide collaborators shared by every session.
pub struct SessionContext {
    pub runtime: Arc<dyn ContainerRuntimeApi>,
    pub readiness: Arc<dyn SessionReadiness>,
    pub settings: SessionSettings,
    pub proxy_client: ProxyClient,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    access_code: String,
    owner: UserIdentity,
    project: String,
    proxy_port: u16,
    volumes: Vec<VolumeMount>,
    created_at: DateTime<Utc>,
    /// Image to run instead of the builder default (imported sessions).
    image_override: Option<String>,
    builder: Arc<dyn SessionConfigBuilder>,
    context: Arc<SessionContext>,
    table: Weak<SessionTable>,
    status: Mutex<SessionStatus>,
    container_id: Mutex<Option<String>>,
    proxy: RwLock<Option<Arc<SessionProxy>>>,
    started: AtomicBool,
    deleted: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_code", &self.access_code)
            .field("owner", &self.owner.id)
            .field("project", &self.project)
            .field("app_type", &self.app_type())
            .field("proxy_port", &self.proxy_port)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        context: Arc<SessionContext>,
        builder: Arc<dyn SessionConfigBuilder>,
        table: Weak<SessionTable>,
        access_code: String,
        owner: UserIdentity,
        project: String,
        proxy_port: u16,
        volumes: Vec<VolumeMount>,
        image_override: Option<String>,
    ) -> Self {
        Self {
            access_code,
            owner,
            project,
            proxy_port,
            volumes,
            created_at: Utc::now(),
            image_override,
            builder,
            context,
            table,
            status: Mutex::new(SessionStatus::Pending),
            container_id: Mutex::new(None),
            proxy: RwLock::new(None),
            started: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn access_code(&self) -> &str {
        &self.access_code
    }

    pub fn owner(&self) -> &UserIdentity {
        &self.owner
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn app_type(&self) -> AppType {
        self.builder.app_type()
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn volumes(&self) -> &[VolumeMount] {
        &self.volumes
    }

    pub fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    fn set_status(&self, status: SessionStatus) {
        let mut current = lock(&self.status);
        if *current != status {
            debug!(
                "Session {} status {} -> {}",
                self.access_code, *current, status
            );
            *current = status;
        }
    }

    pub fn container_id(&self) -> Option<String> {
        lock(&self.container_id).clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Whether the session still owns its (owner, project, app) slot.
    pub fn holds_slot(&self) -> bool {
        !self.is_deleted() && self.status().occupies_slot()
    }

    /// The open proxy, if traffic may flow.
    pub fn proxy(&self) -> Option<Arc<SessionProxy>> {
        self.proxy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|proxy| proxy.is_open())
            .cloned()
    }

    pub fn image(&self) -> &str {
        self.image_override
            .as_deref()
            .unwrap_or_else(|| self.builder.image())
    }

    pub fn container_name(&self) -> String {
        container_name(
            &self.context.settings.name_prefix,
            self.app_type(),
            &self.access_code,
        )
    }

    /// `host:port` the readiness check and the proxy talk to.
    pub fn target_address(&self) -> String {
        match self.context.settings.address_mode {
            AddressMode::Published => format!("127.0.0.1:{}", self.proxy_port),
            AddressMode::Network => {
                format!("{}:{}", self.container_name(), self.builder.internal_port())
            }
        }
    }

    /// Project directory inside the container.
    pub fn project_dir(&self) -> String {
        self.volumes
            .first()
            .map(|v| v.container_path.clone())
            .unwrap_or_else(|| self.builder.workdir().to_string())
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            access_code: self.access_code.clone(),
            owner: self.owner.id.clone(),
            project: self.project.clone(),
            app_type: self.app_type(),
            proxy_port: self.proxy_port,
            container_id: self.container_id(),
            status: self.status(),
            image: self.image().to_string(),
            volumes: self.volumes.clone(),
            created_at: self.created_at,
        }
    }

    /// Full runtime spec: the builder's spec plus port publishing and the
    /// image override.
    pub fn container_config(&self) -> SessionResult<ContainerConfig> {
        let mut config =
            self.builder
                .build_spec(&self.owner, &self.project, &self.access_code, &self.volumes)?;

        if let Some(ref image) = self.image_override {
            config.image = image.clone();
        }
        if self.context.settings.address_mode == AddressMode::Published {
            config = config.port(self.proxy_port, self.builder.internal_port());
        }
        Ok(config)
    }

    /// Create and start the container, wait for it to answer, then open the
    /// proxy. Returns the container id.
    ///
    /// Runs at most once. On failure the container is removed and the session
    /// leaves the registry.
    pub async fn create_container(&self) -> SessionResult<String> {
        if self.is_deleted() {
            return Err(SessionError::Deleted(self.access_code.clone()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted(self.access_code.clone()));
        }

        match self.start_and_wait().await {
            Ok(container_id) => Ok(container_id),
            Err(err) => {
                error!("Failed to start session {}: {}", self.access_code, err);
                self.rollback().await;
                Err(err)
            }
        }
    }

    async fn start_and_wait(&self) -> SessionResult<String> {
        let config = self.container_config()?;
        self.set_status(SessionStatus::Starting);

        let runtime = &self.context.runtime;
        let container_id = runtime.create_container(&config).await?;
        *lock(&self.container_id) = Some(container_id.clone());
        info!(
            "Created container {} for session {} ({} {}/{})",
            container_id,
            self.access_code,
            self.app_type(),
            self.owner.id,
            self.project
        );
        self.ensure_not_deleted()?;

        runtime.start_container(&container_id).await?;
        self.ensure_not_deleted()?;

        let target = self.target_address();
        self.context
            .readiness
            .wait_until_ready(&self.access_code, &target)
            .await?;
        self.ensure_not_deleted()?;
        self.set_status(SessionStatus::Ready);

        let proxy = SessionProxy::open(
            self.access_code.clone(),
            target,
            self.context.proxy_client.clone(),
            self.context.settings.max_proxy_body_bytes,
        );
        *self.proxy.write().unwrap_or_else(PoisonError::into_inner) = Some(proxy);
        self.set_status(SessionStatus::Running);

        Ok(container_id)
    }

    fn ensure_not_deleted(&self) -> SessionResult<()> {
        if self.is_deleted() {
            return Err(SessionError::Deleted(self.access_code.clone()));
        }
        Ok(())
    }

    /// Undo a failed start. The container may have been created after a
    /// concurrent `delete` finished, so it is torn down either way.
    async fn rollback(&self) {
        let already_deleted = self.deleted.swap(true, Ordering::SeqCst);
        if !already_deleted {
            self.set_status(SessionStatus::Stopping);
        }
        self.close_proxy();
        self.teardown_container().await;
        if !already_deleted {
            self.set_status(SessionStatus::Stopped);
            self.deregister();
        }
    }

    fn close_proxy(&self) {
        let proxy = self
            .proxy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(proxy) = proxy {
            proxy.close();
        }
    }

    /// Stop then remove the container. Failures are logged, never returned.
    /// The handle is released first so the container is torn down only once.
    async fn teardown_container(&self) {
        let Some(container_id) = lock(&self.container_id).take() else {
            return;
        };
        let runtime = &self.context.runtime;

        if let Err(e) = runtime
            .stop_container(&container_id, Some(self.context.settings.stop_timeout_seconds))
            .await
        {
            warn!(
                "Failed to stop container {} of session {}: {}",
                container_id, self.access_code, e
            );
        }
        if let Err(e) = runtime.remove_container(&container_id, true).await {
            warn!(
                "Failed to remove container {} of session {}: {}",
                container_id, self.access_code, e
            );
        }
    }

    fn deregister(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.access_code);
        }
    }

    /// Tear the session down: close the proxy, stop the container (best
    /// effort) and leave the registry. A second call returns
    /// [`DeleteStatus::Error`] and does nothing.
    pub async fn delete(&self) -> DeleteStatus {
        if self.deleted.swap(true, Ordering::SeqCst) {
            warn!("Session {} already deleted", self.access_code);
            return DeleteStatus::Error;
        }

        self.set_status(SessionStatus::Stopping);
        self.close_proxy();
        self.teardown_container().await;
        self.set_status(SessionStatus::Stopped);
        self.deregister();

        info!("Deleted session {}", self.access_code);
        DeleteStatus::Ok
    }

    /// Drop bookkeeping for a container that vanished out of band.
    pub(crate) fn mark_gone(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_proxy();
        self.set_status(SessionStatus::Stopped);
        self.deregister();
    }

    /// Run a one-shot process in the container.
    ///
    /// With `expect_json` the output is reduced to the JSON object it carries;
    /// unparseable output comes back as `{"error": <raw output>}`. Any exec
    /// failure is logged and yields `None`.
    pub async fn run_command(
        &self,
        argv: &[String],
        env: &[(String, String)],
        expect_json: bool,
    ) -> Option<CommandOutput> {
        let Some(container_id) = self.container_id() else {
            error!(
                "Cannot run command in session {}: no container",
                self.access_code
            );
            return None;
        };
        if self.is_deleted() {
            error!(
                "Cannot run command in session {}: session deleted",
                self.access_code
            );
            return None;
        }

        let output = match self.context.runtime.exec(&container_id, argv, env).await {
            Ok(output) => output,
            Err(e) => {
                error!(
                    "Exec in container {} of session {} failed: {}",
                    container_id, self.access_code, e
                );
                return None;
            }
        };

        if !output.success() {
            warn!(
                "Command {:?} in session {} exited with {:?}",
                argv.first(),
                self.access_code,
                output.exit_code
            );
        }

        if !expect_json {
            return Some(CommandOutput::Raw(output.output));
        }

        let (value, parse_error) = agent::reduce_output(&output.output);
        if let Some(e) = parse_error {
            warn!(
                "Unparseable agent output in session {}: {}",
                self.access_code, e
            );
        }
        Some(CommandOutput::Json(value))
    }

    async fn run_agent(&self, keyword: &str, args: Vec<(String, String)>) -> Option<CommandOutput> {
        let argv = agent::agent_argv(&self.context.settings.agent_path, keyword, &args);
        self.run_command(&argv, &args, true).await
    }

    /// Commit the project tree on `branch` through the agent. Returns the
    /// `body` of the agent's reply.
    pub async fn commit(&self, branch: &str) -> Option<String> {
        let args = vec![
            ("BRANCH".to_string(), branch.to_string()),
            ("PROJECT_PATH".to_string(), self.project_dir()),
            (
                "GIT_AUTHOR_NAME".to_string(),
                self.owner.display_name().to_string(),
            ),
            (
                "GIT_AUTHOR_EMAIL".to_string(),
                self.owner.email.clone().unwrap_or_default(),
            ),
        ];

        let output = self.run_agent(KEYWORD_SAVE, args).await?;
        let body = output.as_json().and_then(agent::envelope_body);
        if body.is_none() {
            warn!(
                "Commit in session {} returned no body: {}",
                self.access_code,
                output.as_text()
            );
        }
        body
    }

    /// Copy staged uploads into the project tree through the agent.
    pub async fn copy_uploaded_docs(&self) -> Option<CommandOutput> {
        let args = vec![("PROJECT_PATH".to_string(), self.project_dir())];
        self.run_agent(KEYWORD_COPY_DOCS, args).await
    }

    /// Image reference a suspended session is committed to.
    pub fn suspended_image_ref(&self) -> String {
        format!(
            "{}suspended/{}-{}-{}:latest",
            self.context.settings.name_prefix,
            self.app_type(),
            sanitize_image_component(&self.owner.id),
            sanitize_image_component(&self.project)
        )
    }

    /// Commit the live container to its suspended image. Best effort.
    pub async fn export_to_image(&self) -> Option<String> {
        let image_ref = self.suspended_image_ref();
        self.commit_to(&image_ref).await
    }

    /// Commit the live container onto the image it was started from. Best
    /// effort.
    pub async fn override_image(&self) -> Option<String> {
        let image_ref = self.image().to_string();
        self.commit_to(&image_ref).await
    }

    async fn commit_to(&self, image_ref: &str) -> Option<String> {
        let container_id = self.container_id()?;
        match self.context.runtime.commit(&container_id, image_ref).await {
            Ok(image_id) => {
                info!(
                    "Committed session {} to {} ({})",
                    self.access_code, image_ref, image_id
                );
                Some(image_id)
            }
            Err(e) => {
                warn!(
                    "Failed to commit session {} to {}: {}",
                    self.access_code, image_ref, e
                );
                None
            }
        }
    }
}

/// Image names must be lowercase and limited to `[a-z0-9._-]`.
fn sanitize_image_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}
