//! Test utilities and common setup.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use labspace::api::{self, AppState};
use labspace::container::{
    Container, ContainerConfig, ContainerResult, ContainerRuntimeApi, ContainerState, ExecOutput,
};
use labspace::session::{
    AppCatalog, SessionReadiness, SessionRegistry, SessionResult, SessionSettings,
};

/// In-memory runtime: containers "run" as soon as they are started.
#[derive(Default)]
pub struct FakeRuntime {
    pub created: Mutex<Vec<ContainerConfig>>,
    pub running: Mutex<HashMap<String, HashMap<String, String>>>,
    pub removed: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl FakeRuntime {
    pub fn kill(&self, container_id: &str) {
        self.running.lock().unwrap().remove(container_id);
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(config.clone());
        Ok(format!("{:012x}", n))
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.running
            .lock()
            .unwrap()
            .insert(container_id.to_string(), HashMap::new());
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.running.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn list_containers(
        &self,
        _label_filter: Option<&str>,
        _all: bool,
    ) -> ContainerResult<Vec<Container>> {
        Ok(self
            .running
            .lock()
            .unwrap()
            .iter()
            .map(|(id, labels)| Container {
                id: id.clone(),
                names: Vec::new(),
                image: String::new(),
                state: ContainerState::Running,
                labels: labels.clone(),
            })
            .collect())
    }

    async fn exec(
        &self,
        _container_id: &str,
        argv: &[String],
        _env: &[(String, String)],
    ) -> ContainerResult<ExecOutput> {
        let output = match argv.get(1).map(String::as_str) {
            Some("save") => {
                let branch = argv
                    .iter()
                    .find_map(|a| a.strip_prefix("BRANCH="))
                    .unwrap_or("?");
                format!("noise\n{{\"body\": \"saved {}\"}}\n", branch)
            }
            _ => format!("{}\n", argv[1..].join(" ")),
        };
        Ok(ExecOutput {
            exit_code: Some(0),
            output,
        })
    }

    async fn commit(&self, container_id: &str, _image_ref: &str) -> ContainerResult<String> {
        Ok(format!("sha256:{}", container_id))
    }
}

pub struct NoopReadiness;

#[async_trait]
impl SessionReadiness for NoopReadiness {
    async fn wait_until_ready(&self, _access_code: &str, _target: &str) -> SessionResult<()> {
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub registry: Arc<SessionRegistry>,
    pub runtime: Arc<FakeRuntime>,
}

/// Build the app over a fake runtime, handing out proxy ports from `ports`.
pub fn test_app_with_ports(ports: Range<u16>) -> TestApp {
    let runtime = Arc::new(FakeRuntime::default());
    let settings = SessionSettings {
        port_range: ports,
        ..Default::default()
    };
    let registry = Arc::new(SessionRegistry::new(
        runtime.clone(),
        Arc::new(NoopReadiness),
        AppCatalog::default(),
        settings,
    ));
    let router = api::create_router(AppState::new(registry.clone()));
    TestApp {
        router,
        registry,
        runtime,
    }
}

/// Create a test application with all services initialized.
pub fn test_app() -> TestApp {
    test_app_with_ports(30000..30100)
}
