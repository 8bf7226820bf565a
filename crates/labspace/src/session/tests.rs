use super::*;
use crate::container::{
    Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
    ContainerState, ExecOutput,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeRuntime {
    created: Mutex<Vec<ContainerConfig>>,
    running: Mutex<HashMap<String, HashMap<String, String>>>,
    exited: Mutex<HashMap<String, HashMap<String, String>>>,
    labels: Mutex<HashMap<String, HashMap<String, String>>>,
    stopped: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
    commits: Mutex<Vec<(String, String)>>,
    counter: AtomicUsize,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    stop_delay_ms: AtomicU64,
}

impl FakeRuntime {
    /// Simulate a container dying out of band.
    fn kill(&self, container_id: &str) {
        if let Some(labels) = self.running.lock().unwrap().remove(container_id) {
            self.exited
                .lock()
                .unwrap()
                .insert(container_id.to_string(), labels);
        }
    }

    fn add_foreign(&self, container_id: &str, labels: &[(&str, &str)]) {
        self.running.lock().unwrap().insert(
            container_id.to_string(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    fn add_foreign_exited(&self, container_id: &str, labels: &[(&str, &str)]) {
        self.exited.lock().unwrap().insert(
            container_id.to_string(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{:012x}", n);
        self.created.lock().unwrap().push(config.clone());
        self.labels.lock().unwrap().insert(
            id.clone(),
            config
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: "simulated start failure".to_string(),
            });
        }
        let labels = self
            .labels
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .unwrap_or_default();
        self.running
            .lock()
            .unwrap()
            .insert(container_id.to_string(), labels);
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let delay = self.stop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.stopped.lock().unwrap().push(container_id.to_string());
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "stop".to_string(),
                message: "simulated stop failure".to_string(),
            });
        }
        self.kill(container_id);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        self.running.lock().unwrap().remove(container_id);
        self.exited.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn list_containers(
        &self,
        _label_filter: Option<&str>,
        all: bool,
    ) -> ContainerResult<Vec<Container>> {
        let row = |id: &String, labels: &HashMap<String, String>, state| Container {
            id: id.clone(),
            names: Vec::new(),
            image: String::new(),
            state,
            labels: labels.clone(),
        };

        let mut containers: Vec<Container> = self
            .running
            .lock()
            .unwrap()
            .iter()
            .map(|(id, labels)| row(id, labels, ContainerState::Running))
            .collect();
        if all {
            containers.extend(
                self.exited
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(id, labels)| row(id, labels, ContainerState::Exited)),
            );
        }
        Ok(containers)
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        _env: &[(String, String)],
    ) -> ContainerResult<ExecOutput> {
        self.execs
            .lock()
            .unwrap()
            .push((container_id.to_string(), argv.to_vec()));

        let output = match argv.first().map(String::as_str) {
            Some("echo") => format!("{}\n", argv[1..].join(" ")),
            Some(_) => match argv.get(1).map(String::as_str) {
                Some("save") => {
                    let branch = argv
                        .iter()
                        .find_map(|a| a.strip_prefix("BRANCH="))
                        .unwrap_or("?");
                    format!(
                        "[agent] staging files\n{{\"body\": \"committed to {}\"}}\n[agent] done\n",
                        branch
                    )
                }
                Some("copy-docs") => "{\"copied\": 2}".to_string(),
                _ => "agent: unknown keyword".to_string(),
            },
            None => String::new(),
        };

        Ok(ExecOutput {
            exit_code: Some(0),
            output,
        })
    }

    async fn commit(&self, container_id: &str, image_ref: &str) -> ContainerResult<String> {
        self.commits
            .lock()
            .unwrap()
            .push((container_id.to_string(), image_ref.to_string()));
        Ok(format!("sha256:{}", container_id))
    }
}

struct NoopReadiness;

#[async_trait]
impl SessionReadiness for NoopReadiness {
    async fn wait_until_ready(&self, _access_code: &str, _target: &str) -> SessionResult<()> {
        Ok(())
    }
}

struct FailingReadiness;

#[async_trait]
impl SessionReadiness for FailingReadiness {
    async fn wait_until_ready(&self, access_code: &str, _target: &str) -> SessionResult<()> {
        Err(SessionError::ReadinessTimeout {
            access_code: access_code.to_string(),
            attempts: 3,
            elapsed: Duration::from_millis(30),
        })
    }
}

/// Readiness that takes a while, to widen race windows.
struct SlowReadiness;

#[async_trait]
impl SessionReadiness for SlowReadiness {
    async fn wait_until_ready(&self, _access_code: &str, _target: &str) -> SessionResult<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

fn settings(ports: Range<u16>) -> SessionSettings {
    SessionSettings {
        port_range: ports,
        ..Default::default()
    }
}

fn registry_with(
    runtime: Arc<FakeRuntime>,
    readiness: Arc<dyn SessionReadiness>,
    ports: Range<u16>,
) -> SessionRegistry {
    SessionRegistry::new(runtime, readiness, AppCatalog::default(), settings(ports))
}

fn registry(runtime: Arc<FakeRuntime>) -> SessionRegistry {
    registry_with(runtime, Arc::new(NoopReadiness), 30000..30100)
}

fn user(id: &str) -> UserIdentity {
    UserIdentity {
        id: id.to_string(),
        name: Some(format!("User {}", id)),
        email: Some(format!("{}@example.org", id)),
    }
}

fn project_volumes() -> Vec<VolumeMount> {
    vec![
        VolumeMount::read_write("/srv/projects/p1", "/home/rstudio/p1"),
        VolumeMount::read_only("/srv/templates", "/templates"),
    ]
}

#[tokio::test]
async fn rstudio_session_end_to_end() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());

    let session = registry
        .create_session(&user("u"), "p", AppType::Rstudio, project_volumes())
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Pending);

    let container_id = session.create_container().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Running);
    assert_eq!(session.container_id().as_deref(), Some(container_id.as_str()));

    let output = session
        .run_command(&["echo".to_string(), "hi".to_string()], &[], false)
        .await
        .unwrap();
    assert!(output.as_text().contains("hi"));

    let body = session.commit("master").await.unwrap();
    assert_eq!(body, "committed to master");

    let code = session.access_code().to_string();
    assert_eq!(session.delete().await, DeleteStatus::Ok);
    assert!(registry.get_session_by_code(&code).is_none());
    assert!(runtime.removed.lock().unwrap().contains(&container_id));
}

#[tokio::test]
async fn spec_publishes_app_port_on_proxy_port() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());

    let session = registry
        .create_session(&user("u"), "p", AppType::Rstudio, project_volumes())
        .unwrap();
    session.create_container().await.unwrap();

    let created = runtime.created.lock().unwrap();
    let spec = &created[0];
    assert_eq!(spec.ports.len(), 1);
    assert_eq!(spec.ports[0].host_ip, "127.0.0.1");
    assert_eq!(spec.ports[0].host_port, session.proxy_port());
    assert_eq!(spec.ports[0].container_port, 8787);
    assert_eq!(
        session.target_address(),
        format!("127.0.0.1:{}", session.proxy_port())
    );
    assert_eq!(
        session.proxy().map(|p| p.target().to_string()),
        Some(session.target_address())
    );
}

#[tokio::test]
async fn network_mode_targets_container_name() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = SessionRegistry::new(
        runtime.clone(),
        Arc::new(NoopReadiness),
        AppCatalog::default(),
        SessionSettings {
            address_mode: AddressMode::Network,
            ..settings(30000..30010)
        },
    );

    let session = registry
        .create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
    session.create_container().await.unwrap();

    assert!(runtime.created.lock().unwrap()[0].ports.is_empty());
    assert_eq!(
        session.target_address(),
        format!("labspace-jupyter-{}:8888", session.access_code())
    );
}

#[tokio::test]
async fn create_container_runs_once() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());

    let session = registry
        .create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
    session.create_container().await.unwrap();

    assert!(matches!(
        session.create_container().await,
        Err(SessionError::AlreadyStarted(_))
    ));
    assert_eq!(runtime.created_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creation_yields_unique_codes_and_ports() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = Arc::new(registry_with(
        runtime,
        Arc::new(NoopReadiness),
        30000..30500,
    ));

    let mut handles = Vec::new();
    for i in 0..200 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .create_session(&user("u"), &format!("p{}", i), AppType::Vscode, Vec::new())
                .unwrap()
        }));
    }

    let mut codes = HashSet::new();
    let mut ports = HashSet::new();
    for handle in handles {
        let session = handle.await.unwrap();
        assert!(codes.insert(session.access_code().to_string()));
        assert!(ports.insert(session.proxy_port()));
    }
    assert_eq!(registry.len(), 200);
}

#[tokio::test]
async fn ports_run_out_and_are_reused_after_delete() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry_with(runtime, Arc::new(NoopReadiness), 30000..30002);

    let a = registry
        .create_session(&user("u"), "a", AppType::Rstudio, Vec::new())
        .unwrap();
    let _b = registry
        .create_session(&user("u"), "b", AppType::Rstudio, Vec::new())
        .unwrap();
    assert!(matches!(
        registry.create_session(&user("u"), "c", AppType::Rstudio, Vec::new()),
        Err(SessionError::PortsExhausted)
    ));

    let freed = a.proxy_port();
    assert_eq!(
        registry.delete_session(a.access_code()).await.unwrap(),
        DeleteStatus::Ok
    );

    let c = registry
        .create_session(&user("u"), "c", AppType::Rstudio, Vec::new())
        .unwrap();
    assert_eq!(c.proxy_port(), freed);
}

#[tokio::test]
async fn second_create_for_same_triple_conflicts() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime);

    registry
        .create_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .unwrap();
    assert!(matches!(
        registry.create_session(&user("u"), "p", AppType::Rstudio, Vec::new()),
        Err(SessionError::Conflict(_))
    ));
    // Other app types and owners are independent.
    registry
        .create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
    registry
        .create_session(&user("v"), "p", AppType::Rstudio, Vec::new())
        .unwrap();
}

#[tokio::test]
async fn get_or_create_returns_same_session() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime);

    let (first, created) = registry
        .get_or_create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
    assert!(created);
    let (second, created) = registry
        .get_or_create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
    assert!(!created);
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(
        &first,
        &registry.get_session("u", "p", AppType::Jupyter).unwrap()
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_launches_spawn_one_container() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = Arc::new(registry_with(
        runtime.clone(),
        Arc::new(SlowReadiness),
        30000..30100,
    ));

    let launches = (0..10).map(|_| {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .launch_session(&user("u"), "p", AppType::Rstudio, project_volumes())
                .await
                .unwrap()
        })
    });
    let sessions: Vec<Arc<Session>> = futures::future::join_all(launches)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    for session in &sessions {
        assert!(Arc::ptr_eq(session, &sessions[0]));
        assert_eq!(session.status(), SessionStatus::Running);
    }
    assert_eq!(runtime.created_count(), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn deleting_unknown_token_leaves_table_untouched() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    registry
        .create_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .unwrap();

    assert!(matches!(
        registry.delete_session("does-not-exist").await,
        Err(SessionError::NotFound(code)) if code == "does-not-exist"
    ));
    assert_eq!(registry.len(), 1);
    assert!(runtime.stopped.lock().unwrap().is_empty());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());

    let session = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .await
        .unwrap();

    assert_eq!(session.delete().await, DeleteStatus::Ok);
    assert_eq!(session.delete().await, DeleteStatus::Error);
    assert_eq!(runtime.stopped.lock().unwrap().len(), 1);
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(session.proxy().is_none());
}

#[tokio::test]
async fn stop_failure_still_deregisters() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.fail_stop.store(true, Ordering::SeqCst);
    let registry = registry(runtime.clone());

    let session = registry
        .launch_session(&user("u"), "p", AppType::Vscode, Vec::new())
        .await
        .unwrap();
    let status = registry.delete_session(session.access_code()).await.unwrap();

    assert_eq!(status, DeleteStatus::Ok);
    assert!(registry.is_empty());
    assert!(registry.get_session("u", "p", AppType::Vscode).is_none());
}

#[tokio::test]
async fn readiness_timeout_rolls_back_allocation() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry_with(runtime.clone(), Arc::new(FailingReadiness), 30000..30001);

    let err = registry
        .launch_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ReadinessTimeout { .. }));

    assert!(registry.is_empty());
    assert_eq!(runtime.removed.lock().unwrap().len(), 1);
    // The single port is free again.
    registry
        .create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
}

#[tokio::test]
async fn start_failure_rolls_back_allocation() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.fail_start.store(true, Ordering::SeqCst);
    let registry = registry(runtime.clone());

    let err = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Runtime(_)));
    assert!(registry.is_empty());
    assert_eq!(runtime.removed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn reconcile_removes_only_sessions_with_missing_containers() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());

    let alive = registry
        .launch_session(&user("u"), "a", AppType::Rstudio, Vec::new())
        .await
        .unwrap();
    let dead = registry
        .launch_session(&user("u"), "b", AppType::Rstudio, Vec::new())
        .await
        .unwrap();
    let pending = registry
        .create_session(&user("u"), "c", AppType::Rstudio, Vec::new())
        .unwrap();

    runtime.kill(&dead.container_id().unwrap());

    let removed = registry.reconcile().await.unwrap();
    assert_eq!(removed, vec![dead.access_code().to_string()]);
    assert!(registry.get_session_by_code(dead.access_code()).is_none());
    assert!(registry.get_session_by_code(alive.access_code()).is_some());
    assert!(registry.get_session_by_code(pending.access_code()).is_some());
    assert!(dead.proxy().is_none());

    // Nothing left to remove.
    assert!(registry.reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn connection_scoped_sessions_follow_the_connection() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime);

    let ops = registry
        .launch_session(&user("u"), "p", AppType::Operations, Vec::new())
        .await
        .unwrap();
    let rstudio = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .await
        .unwrap();
    let other_ops = registry
        .launch_session(&user("v"), "p", AppType::Operations, Vec::new())
        .await
        .unwrap();

    let deleted = registry.delete_connection_scoped("u").await;
    assert_eq!(deleted, vec![ops.access_code().to_string()]);
    assert!(registry.get_session_by_code(rstudio.access_code()).is_some());
    assert!(registry.get_session_by_code(other_ops.access_code()).is_some());
}

#[tokio::test]
async fn json_output_is_reduced_or_degraded() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime);
    let session = registry
        .launch_session(&user("u"), "p", AppType::Operations, Vec::new())
        .await
        .unwrap();

    let docs = session.copy_uploaded_docs().await.unwrap();
    assert_eq!(docs.as_json().unwrap()["copied"], 2);

    let noisy = session
        .run_command(
            &["/usr/local/bin/labspace-agent".to_string(), "bogus".to_string()],
            &[],
            true,
        )
        .await
        .unwrap();
    assert_eq!(
        noisy.as_json().unwrap()["error"],
        "agent: unknown keyword"
    );
}

#[tokio::test]
async fn commands_need_a_container() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    let session = registry
        .create_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .unwrap();

    assert!(
        session
            .run_command(&["echo".to_string()], &[], false)
            .await
            .is_none()
    );
    assert!(session.commit("main").await.is_none());
    assert!(runtime.execs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn commit_passes_identity_and_branch_to_agent() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    let session = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, project_volumes())
        .await
        .unwrap();

    session.commit("feature-x").await.unwrap();

    let execs = runtime.execs.lock().unwrap();
    let (_, argv) = &execs[0];
    assert_eq!(argv[0], "/usr/local/bin/labspace-agent");
    assert_eq!(argv[1], "save");
    assert!(argv.contains(&"BRANCH=feature-x".to_string()));
    assert!(argv.contains(&"PROJECT_PATH=/home/rstudio/p1".to_string()));
    assert!(argv.contains(&"GIT_AUTHOR_EMAIL=u@example.org".to_string()));
}

#[tokio::test]
async fn suspend_and_import_round_trip() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    let session = registry
        .launch_session(&user("U1"), "Proj 1", AppType::Rstudio, Vec::new())
        .await
        .unwrap();

    let image_id = session.export_to_image().await.unwrap();
    assert!(image_id.starts_with("sha256:"));
    let image_ref = runtime.commits.lock().unwrap()[0].1.clone();
    assert_eq!(image_ref, "labspace-suspended/rstudio-u1-proj-1:latest");

    registry.delete_session(session.access_code()).await.unwrap();

    let imported = registry
        .import_session(&user("U1"), "Proj 1", AppType::Rstudio, Vec::new(), &image_ref)
        .await
        .unwrap();
    assert_eq!(imported.status(), SessionStatus::Running);
    assert_eq!(imported.image(), image_ref);
    assert_eq!(runtime.created.lock().unwrap()[1].image, image_ref);
}

#[tokio::test]
async fn override_image_commits_onto_source_image() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    let session = registry
        .launch_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .await
        .unwrap();

    session.override_image().await.unwrap();
    assert_eq!(
        runtime.commits.lock().unwrap()[0].1,
        "quay.io/jupyter/base-notebook:latest"
    );
}

#[tokio::test]
async fn import_rejects_invalid_image() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());

    let err = registry
        .import_session(&user("u"), "p", AppType::Rstudio, Vec::new(), "bad image;rm")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Runtime(ContainerError::InvalidInput(_))));
    assert!(registry.is_empty());
    assert_eq!(runtime.created_count(), 0);
}

#[tokio::test]
async fn orphan_containers_are_removed() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    let live = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .await
        .unwrap();

    runtime.add_foreign(
        "orphan000001",
        &[
            (apps::LABEL_MANAGED, "true"),
            (apps::LABEL_ACCESS_CODE, "stale-code"),
        ],
    );

    let removed = registry.cleanup_orphans().await.unwrap();
    assert_eq!(removed, 1);
    let removed_ids = runtime.removed.lock().unwrap().clone();
    assert_eq!(removed_ids, vec!["orphan000001".to_string()]);
    assert!(registry.get_session_by_code(live.access_code()).is_some());
}

#[tokio::test]
async fn exited_orphan_containers_are_removed() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());

    runtime.add_foreign_exited(
        "orphan000002",
        &[
            (apps::LABEL_MANAGED, "true"),
            (apps::LABEL_ACCESS_CODE, "crashed-code"),
        ],
    );

    assert_eq!(registry.cleanup_orphans().await.unwrap(), 1);
    assert!(runtime.exited.lock().unwrap().is_empty());
    assert_eq!(
        runtime.removed.lock().unwrap().clone(),
        vec!["orphan000002".to_string()]
    );
}

#[tokio::test]
async fn exited_session_container_counts_as_gone() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    let session = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .await
        .unwrap();

    runtime.kill(&session.container_id().unwrap());

    let removed = registry.reconcile().await.unwrap();
    assert_eq!(removed, vec![session.access_code().to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relaunch_while_deleting_gets_a_fresh_session() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = Arc::new(registry(runtime.clone()));

    let old = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .await
        .unwrap();
    runtime.stop_delay_ms.store(100, Ordering::SeqCst);

    let deleting = {
        let registry = registry.clone();
        let code = old.access_code().to_string();
        tokio::spawn(async move { registry.delete_session(&code).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(old.status(), SessionStatus::Stopping);
    assert!(registry.get_session("u", "p", AppType::Rstudio).is_none());

    let fresh = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, Vec::new())
        .await
        .unwrap();
    assert_ne!(fresh.access_code(), old.access_code());
    assert_eq!(fresh.status(), SessionStatus::Running);
    assert!(fresh.proxy().is_some());

    assert_eq!(deleting.await.unwrap().unwrap(), DeleteStatus::Ok);
    assert_eq!(old.status(), SessionStatus::Stopped);

    // The old session leaving the table does not evict its successor.
    assert_eq!(registry.len(), 1);
    let current = registry.get_session("u", "p", AppType::Rstudio).unwrap();
    assert_eq!(current.access_code(), fresh.access_code());
    assert!(registry.get_session_by_code(fresh.access_code()).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_during_start_rolls_back() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry_with(runtime.clone(), Arc::new(SlowReadiness), 30000..30001);

    let session = registry
        .create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.create_container().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.status(), SessionStatus::Starting);

    assert_eq!(session.delete().await, DeleteStatus::Ok);

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(SessionError::Deleted(code)) if code == session.access_code()));
    assert!(registry.is_empty());
    assert!(runtime.running.lock().unwrap().is_empty());
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(session.proxy().is_none());
    // The single port is free again.
    registry
        .create_session(&user("u"), "p", AppType::Jupyter, Vec::new())
        .unwrap();
}

#[tokio::test]
async fn shutdown_deletes_everything() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime.clone());
    for project in ["a", "b", "c"] {
        registry
            .launch_session(&user("u"), project, AppType::Vscode, Vec::new())
            .await
            .unwrap();
    }

    assert_eq!(registry.shutdown_all().await, 3);
    assert!(registry.is_empty());
    assert!(runtime.running.lock().unwrap().is_empty());
}

#[tokio::test]
async fn descriptor_reflects_session() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime);
    let session = registry
        .launch_session(&user("u"), "p", AppType::Rstudio, project_volumes())
        .await
        .unwrap();

    let descriptor = session.descriptor();
    assert_eq!(descriptor.access_code, session.access_code());
    assert_eq!(descriptor.owner, "u");
    assert_eq!(descriptor.app_type, AppType::Rstudio);
    assert_eq!(descriptor.status, SessionStatus::Running);
    assert_eq!(descriptor.volumes, project_volumes());
    assert!(descriptor.container_id.is_some());

    let json = serde_json::to_value(&descriptor).unwrap();
    assert_eq!(json["app_type"], "rstudio");
    assert_eq!(json["volumes"][1]["mode"], "ro");
}

#[tokio::test]
async fn user_sessions_are_filtered_by_owner() {
    let runtime = Arc::new(FakeRuntime::default());
    let registry = registry(runtime);
    registry
        .create_session(&user("u"), "a", AppType::Rstudio, Vec::new())
        .unwrap();
    registry
        .create_session(&user("u"), "b", AppType::Jupyter, Vec::new())
        .unwrap();
    registry
        .create_session(&user("v"), "a", AppType::Rstudio, Vec::new())
        .unwrap();

    assert_eq!(registry.get_user_sessions("u").len(), 2);
    assert_eq!(registry.get_user_sessions("v").len(), 1);
    assert!(registry.get_user_sessions("w").is_empty());
}
