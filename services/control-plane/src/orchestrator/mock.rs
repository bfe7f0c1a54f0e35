//! In-memory orchestrator for tests and local development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ExecOutput, Orchestrator, OrchestratorError, ServiceInfo, ServiceSpec, TaskInfo};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Update,
    Inspect,
    ListTasks,
    UpdateReplicas,
    Remove,
    ListServices,
    Exec,
}

#[derive(Debug, Clone)]
struct MockService {
    id: String,
    spec: ServiceSpec,
    replicas: u32,
    version: u64,
}

#[derive(Default)]
struct MockState {
    services: BTreeMap<String, MockService>,
    execs: Vec<(String, Vec<String>)>,
    exit_codes: Vec<(String, i64)>,
    port_overrides: HashMap<String, u16>,
    failures: HashSet<MockOp>,
    delay: Option<Duration>,
}

/// Mock orchestrator.
///
/// Tasks of a service report `node_addr = None`, so callers fall back to
/// their configured host.
#[derive(Default)]
pub struct MockOrchestrator {
    state: Mutex<MockState>,
    counter: AtomicU64,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every call of `op` fail until cleared.
    pub fn fail_on(&self, op: MockOp) {
        self.state().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Delay every call (for timeout tests).
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Report `port` as the published port of `service`, whatever was requested.
    pub fn override_published_port(&self, service: &str, port: u16) {
        self.state().port_overrides.insert(service.to_string(), port);
    }

    /// Exit code for exec commands whose joined text contains `pattern`.
    /// Later registrations win.
    pub fn set_exec_exit_code(&self, pattern: &str, exit_code: i64) {
        self.state().exit_codes.push((pattern.to_string(), exit_code));
    }

    /// Recorded exec calls as `(container, command)`.
    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state().execs.clone()
    }

    /// Number of exec calls whose joined command contains `pattern`.
    pub fn exec_count(&self, pattern: &str) -> usize {
        self.state()
            .execs
            .iter()
            .filter(|(_, cmd)| cmd.join(" ").contains(pattern))
            .count()
    }

    /// Names of every service.
    pub fn service_names(&self) -> Vec<String> {
        self.state().services.keys().cloned().collect()
    }

    /// Current spec of a service.
    pub fn spec_of(&self, service: &str) -> Option<ServiceSpec> {
        self.state().services.get(service).map(|s| s.spec.clone())
    }

    /// Current replica count of a service.
    pub fn replicas_of(&self, service: &str) -> Option<u32> {
        self.state().services.get(service).map(|s| s.replicas)
    }

    /// Insert a service directly (simulates state left by an earlier run).
    pub fn seed_service(&self, spec: ServiceSpec) {
        let id = self.next_id();
        let replicas = spec.replicas;
        self.state().services.insert(
            spec.name.clone(),
            MockService {
                id,
                spec,
                replicas,
                version: 1,
            },
        );
    }

    fn next_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("svc_{counter:08x}")
    }

    async fn enter(&self, op: MockOp) -> Result<(), OrchestratorError> {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state().failures.contains(&op) {
            return Err(OrchestratorError::Transport(format!(
                "mock orchestrator configured to fail {op:?}"
            )));
        }
        Ok(())
    }

    fn info(state: &MockState, service: &MockService) -> ServiceInfo {
        let port = state
            .port_overrides
            .get(&service.spec.name)
            .copied()
            .unwrap_or(service.spec.published_port);

        ServiceInfo {
            id: service.id.clone(),
            name: service.spec.name.clone(),
            replicas: service.replicas,
            labels: service.spec.labels.clone(),
            published_ports: vec![port],
            version: service.version,
        }
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceInfo, OrchestratorError> {
        self.enter(MockOp::Create).await?;
        let id = self.next_id();

        let mut state = self.state();
        if state.services.contains_key(&spec.name) {
            return Err(OrchestratorError::Conflict(spec.name.clone()));
        }

        info!(service = %spec.name, image = %spec.image, replicas = spec.replicas, "[MOCK] Creating service");
        let service = MockService {
            id,
            spec: spec.clone(),
            replicas: spec.replicas,
            version: 1,
        };
        let info = Self::info(&state, &service);
        state.services.insert(spec.name.clone(), service);
        Ok(info)
    }

    async fn update_service(&self, spec: &ServiceSpec) -> Result<ServiceInfo, OrchestratorError> {
        self.enter(MockOp::Update).await?;
        let mut state = self.state();
        let svc = state
            .services
            .get_mut(&spec.name)
            .ok_or_else(|| OrchestratorError::NotFound(spec.name.clone()))?;

        debug!(service = %spec.name, image = %spec.image, replicas = spec.replicas, "[MOCK] Updating service");
        svc.spec = spec.clone();
        svc.replicas = spec.replicas;
        svc.version += 1;
        let svc = svc.clone();
        Ok(Self::info(&state, &svc))
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceInfo>, OrchestratorError> {
        self.enter(MockOp::Inspect).await?;
        let state = self.state();
        Ok(state.services.get(name).map(|s| Self::info(&state, s)))
    }

    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskInfo>, OrchestratorError> {
        self.enter(MockOp::ListTasks).await?;
        let state = self.state();
        let Some(svc) = state.services.get(service) else {
            return Ok(Vec::new());
        };
        let info = Self::info(&state, svc);

        Ok((0..svc.replicas)
            .map(|slot| TaskInfo {
                id: format!("{}.{}", svc.id, slot + 1),
                service: service.to_string(),
                state: "running".to_string(),
                node_addr: None,
                published_port: info.published_ports.first().copied(),
            })
            .collect())
    }

    async fn update_replicas(&self, service: &str, replicas: u32) -> Result<(), OrchestratorError> {
        self.enter(MockOp::UpdateReplicas).await?;
        let mut state = self.state();
        let svc = state
            .services
            .get_mut(service)
            .ok_or_else(|| OrchestratorError::NotFound(service.to_string()))?;

        debug!(service, replicas, "[MOCK] Scaling service");
        svc.replicas = replicas;
        svc.version += 1;
        Ok(())
    }

    async fn remove_service(&self, service: &str) -> Result<bool, OrchestratorError> {
        self.enter(MockOp::Remove).await?;
        let removed = self.state().services.remove(service).is_some();
        if removed {
            info!(service, "[MOCK] Removed service");
        }
        Ok(removed)
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, OrchestratorError> {
        self.enter(MockOp::ListServices).await?;
        let state = self.state();
        Ok(state
            .services
            .values()
            .filter(|s| s.spec.labels.contains_key(label))
            .map(|s| Self::info(&state, s))
            .collect())
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput, OrchestratorError> {
        self.enter(MockOp::Exec).await?;
        let mut state = self.state();
        let joined = cmd.join(" ");
        state.execs.push((
            container.to_string(),
            cmd.iter().map(|s| s.to_string()).collect(),
        ));

        let exit_code = state
            .exit_codes
            .iter()
            .rev()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);

        debug!(container, cmd = %joined, exit_code, "[MOCK] Exec");
        Ok(ExecOutput {
            exit_code,
            output: if exit_code == 0 {
                String::new()
            } else {
                format!("mock exit {exit_code}")
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::LABEL_TENANT_ID;

    fn spec(name: &str, replicas: u32) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: "vitrine/store:latest".to_string(),
            labels: BTreeMap::from([(LABEL_TENANT_ID.to_string(), name.to_string())]),
            env: BTreeMap::new(),
            replicas,
            target_port: 3000,
            published_port: 20000,
            mounts: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_inspect_remove() {
        let mock = MockOrchestrator::new();
        mock.create_service(&spec("vt-a", 2)).await.unwrap();

        let info = mock.inspect_service("vt-a").await.unwrap().unwrap();
        assert_eq!(info.replicas, 2);
        assert_eq!(mock.list_tasks("vt-a").await.unwrap().len(), 2);

        assert!(matches!(
            mock.create_service(&spec("vt-a", 1)).await,
            Err(OrchestratorError::Conflict(_))
        ));

        assert!(mock.remove_service("vt-a").await.unwrap());
        assert!(!mock.remove_service("vt-a").await.unwrap());
        assert!(mock.inspect_service("vt-a").await.unwrap().is_none());
        assert!(mock.list_tasks("vt-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_port_override() {
        let mock = MockOrchestrator::new();
        mock.override_published_port("vt-a", 45678);
        let info = mock.create_service(&spec("vt-a", 1)).await.unwrap();
        assert_eq!(info.published_ports, vec![45678]);

        let tasks = mock.list_tasks("vt-a").await.unwrap();
        assert_eq!(tasks[0].published_port, Some(45678));
    }

    #[tokio::test]
    async fn test_update_replaces_spec() {
        let mock = MockOrchestrator::new();
        mock.create_service(&spec("vt-a", 0)).await.unwrap();

        let mut updated = spec("vt-a", 2);
        updated.env.insert("FEATURE".into(), "new".into());
        let info = mock.update_service(&updated).await.unwrap();

        assert_eq!(info.replicas, 2);
        assert_eq!(info.version, 2);
        assert_eq!(mock.spec_of("vt-a").unwrap().env["FEATURE"], "new");
        assert!(matches!(
            mock.update_service(&spec("vt-missing", 1)).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mock = MockOrchestrator::new();
        mock.fail_on(MockOp::Create);
        assert!(mock.create_service(&spec("vt-a", 1)).await.is_err());

        mock.clear_failures();
        assert!(mock.create_service(&spec("vt-a", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_scale_to_zero() {
        let mock = MockOrchestrator::new();
        mock.create_service(&spec("vt-a", 1)).await.unwrap();
        mock.update_replicas("vt-a", 0).await.unwrap();

        let info = mock.inspect_service("vt-a").await.unwrap().unwrap();
        assert!(!info.is_running());
        assert!(mock.list_tasks("vt-a").await.unwrap().is_empty());
        assert!(matches!(
            mock.update_replicas("vt-missing", 1).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_records_and_exit_codes() {
        let mock = MockOrchestrator::new();
        mock.set_exec_exit_code("nginx -t", 1);

        let out = mock.exec("proxy", &["nginx", "-t"]).await.unwrap();
        assert!(!out.success());
        let out = mock.exec("proxy", &["nginx", "-s", "reload"]).await.unwrap();
        assert!(out.success());

        assert_eq!(mock.exec_count("nginx"), 2);
        assert_eq!(mock.exec_calls()[0].0, "proxy");
    }

    #[tokio::test]
    async fn test_list_services_by_label() {
        let mock = MockOrchestrator::new();
        mock.create_service(&spec("vt-a", 1)).await.unwrap();
        let mut unlabelled = spec("proxy", 1);
        unlabelled.labels.clear();
        mock.seed_service(unlabelled);

        let listed = mock.list_services(LABEL_TENANT_ID).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "vt-a");
        assert_eq!(mock.service_names().len(), 2);
    }
}
