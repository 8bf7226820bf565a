//! Authoritative in-memory table of live sessions.
//!
//! Every mutation of the table (token and port allocation, the get-or-create
//! check-then-insert, removal) happens under one lock, so allocation is atomic.
//! Launches additionally serialize per (owner, project, app) triple so that
//! concurrent launches converge on one container.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::container::{ContainerRuntimeApi, validate_image_name};
use crate::proxy::build_proxy_client;

use super::apps::{AppCatalog, LABEL_ACCESS_CODE, managed_label_filter};
use super::error::{SessionError, SessionResult};
use super::models::{AppType, DeleteStatus, SessionStatus, UserIdentity, VolumeMount};
use super::readiness::SessionReadiness;
use super::session::{Session, SessionContext};
use super::settings::SessionSettings;

const ACCESS_CODE_LEN: usize = 20;

/// Lowercase alphanumerics keep codes valid in container names and hostnames.
const ACCESS_CODE_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

type TripleKey = (String, String, AppType);

fn triple_key(owner: &str, project: &str, app_type: AppType) -> TripleKey {
    (owner.to_string(), project.to_string(), app_type)
}

fn generate_access_code() -> String {
    nanoid::nanoid!(ACCESS_CODE_LEN, &ACCESS_CODE_ALPHABET)
}

struct TableInner {
    sessions: HashMap<String, Arc<Session>>,
    by_triple: HashMap<TripleKey, String>,
    free_ports: BTreeSet<u16>,
}

impl TableInner {
    /// Session holding the triple's slot. An index entry whose session is
    /// being torn down no longer holds it and is dropped.
    fn live_for_triple(&mut self, key: &TripleKey) -> Option<Arc<Session>> {
        let code = self.by_triple.get(key)?;
        match self.sessions.get(code).cloned() {
            Some(session) if session.holds_slot() => Some(session),
            _ => {
                self.by_triple.remove(key);
                None
            }
        }
    }
}

/// Session map, triple index and free port set behind one lock.
pub struct SessionTable {
    inner: Mutex<TableInner>,
}

impl SessionTable {
    fn new(settings: &SessionSettings) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                sessions: HashMap::new(),
                by_triple: HashMap::new(),
                free_ports: settings.port_range.clone().collect(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a session and release its port. Idempotent.
    pub(crate) fn remove(&self, access_code: &str) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let session = inner.sessions.remove(access_code)?;

        let key = triple_key(&session.owner().id, session.project(), session.app_type());
        if inner
            .by_triple
            .get(&key)
            .is_some_and(|code| code == access_code)
        {
            inner.by_triple.remove(&key);
        }
        inner.free_ports.insert(session.proxy_port());
        debug!(
            "Session {} removed from registry, port {} released",
            access_code,
            session.proxy_port()
        );
        Some(session)
    }
}

pub struct SessionRegistry {
    table: Arc<SessionTable>,
    context: Arc<SessionContext>,
    catalog: AppCatalog,
    launch_locks: DashMap<TripleKey, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        readiness: Arc<dyn SessionReadiness>,
        catalog: AppCatalog,
        settings: SessionSettings,
    ) -> Self {
        let table = Arc::new(SessionTable::new(&settings));
        let context = Arc::new(SessionContext {
            runtime,
            readiness,
            settings,
            proxy_client: build_proxy_client(),
        });
        Self {
            table,
            context,
            catalog,
            launch_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.context.settings
    }

    pub fn catalog(&self) -> &AppCatalog {
        &self.catalog
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.context.runtime
    }

    pub fn len(&self) -> usize {
        self.table.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a token and a port and register a new, not yet started
    /// session. Fails with [`SessionError::Conflict`] if the triple already
    /// has a live session.
    pub fn create_session(
        &self,
        user: &UserIdentity,
        project: &str,
        app_type: AppType,
        volumes: Vec<VolumeMount>,
    ) -> SessionResult<Arc<Session>> {
        let mut inner = self.table.lock();
        let key = triple_key(&user.id, project, app_type);
        if let Some(existing) = inner.live_for_triple(&key) {
            return Err(SessionError::Conflict(format!(
                "{} session for {}/{} already exists ({})",
                app_type,
                user.id,
                project,
                existing.access_code()
            )));
        }
        self.insert_locked(&mut inner, user, project, app_type, volumes, None)
    }

    fn insert_locked(
        &self,
        inner: &mut TableInner,
        user: &UserIdentity,
        project: &str,
        app_type: AppType,
        volumes: Vec<VolumeMount>,
        image_override: Option<String>,
    ) -> SessionResult<Arc<Session>> {
        let builder = self.catalog.builder(app_type)?;

        let access_code = loop {
            let candidate = generate_access_code();
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
            debug!("Access code collision, regenerating");
        };
        let proxy_port = inner
            .free_ports
            .pop_first()
            .ok_or(SessionError::PortsExhausted)?;

        let session = Arc::new(Session::new(
            self.context.clone(),
            builder,
            Arc::downgrade(&self.table),
            access_code.clone(),
            user.clone(),
            project.to_string(),
            proxy_port,
            volumes,
            image_override,
        ));

        inner
            .by_triple
            .insert(triple_key(&user.id, project, app_type), access_code.clone());
        inner.sessions.insert(access_code.clone(), session.clone());

        info!(
            "Registered {} session {} for {}/{} on port {}",
            app_type, access_code, user.id, project, proxy_port
        );
        Ok(session)
    }

    pub fn get_session_by_code(&self, access_code: &str) -> Option<Arc<Session>> {
        self.table.lock().sessions.get(access_code).cloned()
    }

    /// Live session for a triple, if any.
    pub fn get_session(
        &self,
        owner: &str,
        project: &str,
        app_type: AppType,
    ) -> Option<Arc<Session>> {
        self.table
            .lock()
            .live_for_triple(&triple_key(owner, project, app_type))
    }

    /// Existing session for the triple, or a newly registered one. The flag
    /// tells whether the session was created by this call. A session that is
    /// being deleted does not count as existing.
    pub fn get_or_create_session(
        &self,
        user: &UserIdentity,
        project: &str,
        app_type: AppType,
        volumes: Vec<VolumeMount>,
    ) -> SessionResult<(Arc<Session>, bool)> {
        let mut inner = self.table.lock();
        let key = triple_key(&user.id, project, app_type);
        if let Some(session) = inner.live_for_triple(&key) {
            return Ok((session, false));
        }
        let session = self.insert_locked(&mut inner, user, project, app_type, volumes, None)?;
        Ok((session, true))
    }

    fn launch_lock(&self, key: &TripleKey) -> Arc<tokio::sync::Mutex<()>> {
        self.launch_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_launch_lock(&self, key: &TripleKey) {
        self.launch_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Get-or-create the triple's session and make sure its container runs.
    /// Concurrent launches of one triple wait for each other and return the
    /// same session.
    pub async fn launch_session(
        &self,
        user: &UserIdentity,
        project: &str,
        app_type: AppType,
        volumes: Vec<VolumeMount>,
    ) -> SessionResult<Arc<Session>> {
        let key = triple_key(&user.id, project, app_type);
        let lock = self.launch_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.launch_locked(user, project, app_type, volumes).await
        };
        drop(lock);
        self.release_launch_lock(&key);
        result
    }

    async fn launch_locked(
        &self,
        user: &UserIdentity,
        project: &str,
        app_type: AppType,
        volumes: Vec<VolumeMount>,
    ) -> SessionResult<Arc<Session>> {
        let (session, created) = self.get_or_create_session(user, project, app_type, volumes)?;
        if !created {
            debug!(
                "Reusing {} session {} for {}/{}",
                app_type,
                session.access_code(),
                user.id,
                project
            );
        }
        if session.status() == SessionStatus::Pending {
            session.create_container().await?;
        }
        Ok(session)
    }

    /// Bring a previously suspended image back as a running session.
    pub async fn import_session(
        &self,
        user: &UserIdentity,
        project: &str,
        app_type: AppType,
        volumes: Vec<VolumeMount>,
        image: &str,
    ) -> SessionResult<Arc<Session>> {
        validate_image_name(image)?;

        let key = triple_key(&user.id, project, app_type);
        let lock = self.launch_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.import_locked(&key, user, project, app_type, volumes, image)
                .await
        };
        drop(lock);
        self.release_launch_lock(&key);
        result
    }

    async fn import_locked(
        &self,
        key: &TripleKey,
        user: &UserIdentity,
        project: &str,
        app_type: AppType,
        volumes: Vec<VolumeMount>,
        image: &str,
    ) -> SessionResult<Arc<Session>> {
        let session = {
            let mut inner = self.table.lock();
            if let Some(existing) = inner.live_for_triple(key) {
                return Err(SessionError::Conflict(format!(
                    "{} session for {}/{} already exists ({})",
                    app_type,
                    user.id,
                    project,
                    existing.access_code()
                )));
            }
            self.insert_locked(
                &mut inner,
                user,
                project,
                app_type,
                volumes,
                Some(image.to_string()),
            )?
        };
        info!(
            "Importing session {} from image {}",
            session.access_code(),
            image
        );
        session.create_container().await?;
        Ok(session)
    }

    pub fn get_user_sessions(&self, owner: &str) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .table
            .lock()
            .sessions
            .values()
            .filter(|session| session.owner().id == owner)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.access_code().cmp(b.access_code()));
        sessions
    }

    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.table.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.access_code().cmp(b.access_code()));
        sessions
    }

    /// Delete a session by token. Unknown tokens fail without touching the
    /// table.
    pub async fn delete_session(&self, access_code: &str) -> SessionResult<DeleteStatus> {
        let session = self
            .get_session_by_code(access_code)
            .ok_or_else(|| SessionError::NotFound(access_code.to_string()))?;

        let status = session.delete().await;
        self.table.remove(access_code);
        Ok(status)
    }

    /// Delete the owner's connection-scoped sessions. Called when the owner's
    /// control connection goes away.
    pub async fn delete_connection_scoped(&self, owner: &str) -> Vec<String> {
        let mut deleted = Vec::new();
        for session in self.get_user_sessions(owner) {
            if !session.app_type().is_connection_scoped() {
                continue;
            }
            let code = session.access_code().to_string();
            match self.delete_session(&code).await {
                Ok(_) => deleted.push(code),
                Err(e) => warn!("Failed to delete session {}: {}", code, e),
            }
        }
        if !deleted.is_empty() {
            info!(
                "Deleted {} connection-scoped session(s) of {}",
                deleted.len(),
                owner
            );
        }
        deleted
    }

    /// Drop sessions whose container is no longer running. Sessions that are
    /// still starting or have no container yet are left alone.
    pub async fn reconcile(&self) -> SessionResult<Vec<String>> {
        let containers = self
            .context
            .runtime
            .list_containers(Some(&managed_label_filter()), false)
            .await?;

        let mut removed = Vec::new();
        for session in self.list_sessions() {
            if !matches!(
                session.status(),
                SessionStatus::Ready | SessionStatus::Running
            ) {
                continue;
            }
            let Some(container_id) = session.container_id() else {
                continue;
            };
            if containers.iter().any(|c| c.matches_id(&container_id)) {
                continue;
            }

            warn!(
                "Container {} of session {} is gone, removing session",
                container_id,
                session.access_code()
            );
            session.mark_gone();
            if let Err(e) = self
                .context
                .runtime
                .remove_container(&container_id, true)
                .await
            {
                debug!("Leftover container {} not removed: {}", container_id, e);
            }
            removed.push(session.access_code().to_string());
        }

        if !removed.is_empty() {
            info!("Reconcile removed {} session(s)", removed.len());
        }
        Ok(removed)
    }

    /// Remove managed containers that belong to no live session, e.g. after a
    /// restart or a teardown whose `rm` failed. Exited containers are swept
    /// too. Returns the number of containers removed.
    pub async fn cleanup_orphans(&self) -> SessionResult<usize> {
        let containers = self
            .context
            .runtime
            .list_containers(Some(&managed_label_filter()), true)
            .await?;

        let mut removed = 0;
        for container in containers {
            let known = container
                .labels
                .get(LABEL_ACCESS_CODE)
                .is_some_and(|code| self.get_session_by_code(code).is_some());
            if known {
                continue;
            }

            info!(
                "Removing orphan container {} ({:?})",
                container.id, container.names
            );
            match self
                .context
                .runtime
                .remove_container(&container.id, true)
                .await
            {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphan container {}: {}", container.id, e),
            }
        }
        Ok(removed)
    }

    /// Delete every live session. Returns how many were deleted cleanly.
    pub async fn shutdown_all(&self) -> usize {
        let sessions = self.list_sessions();
        if sessions.is_empty() {
            info!("No active sessions to stop");
            return 0;
        }

        info!("Stopping {} active session(s)...", sessions.len());
        let mut stopped = 0;
        for session in sessions {
            match self.delete_session(session.access_code()).await {
                Ok(DeleteStatus::Ok) => stopped += 1,
                Ok(DeleteStatus::Error) => {
                    warn!("Session {} was already deleted", session.access_code())
                }
                Err(e) => warn!("Failed to stop session {}: {}", session.access_code(), e),
            }
        }
        stopped
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("catalog", &self.catalog)
            .finish()
    }
}
