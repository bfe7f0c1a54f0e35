//! Service instance manager.
//!
//! Launches, inspects, scales and removes tenant services through the
//! [`Orchestrator`], bounding every call with the configured timeout, and
//! tracks the lifecycle status of each instance:
//!
//! ```text
//! provisioning -> starting -> testing -> healthy
//!                                     \-> failed
//! (any) -> stopped   (scaled to zero)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vitrine_namespace::{TenantId, TenantKind, TenantNamespace};

use crate::config::InstanceConfig;
use crate::orchestrator::{
    bounded, Mount, Orchestrator, OrchestratorError, ServiceInfo, ServiceSpec, LABEL_KIND,
    LABEL_TENANT_ID,
};
use crate::registry::Backend;
use crate::tenant::TenantRecord;

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Provisioning,
    Starting,
    Testing,
    Healthy,
    Failed,
    Stopped,
}

/// A tracked tenant service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInstance {
    pub kind: TenantKind,
    pub tenant_id: TenantId,
    pub service_name: String,
    pub external_host: String,
    pub external_port: u16,
    pub replicas: u32,
    #[serde(skip_serializing)]
    pub environment: BTreeMap<String, String>,
    pub status: InstanceStatus,
    pub updated_at: DateTime<Utc>,
}

/// Where a launched instance can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

impl InstanceHandle {
    /// `http://host:port{path}`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

/// Service instance manager.
pub struct ServiceInstanceManager {
    orchestrator: Arc<dyn Orchestrator>,
    config: InstanceConfig,
    timeout: Duration,
    instances: RwLock<HashMap<String, ServiceInstance>>,
}

impl ServiceInstanceManager {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, config: InstanceConfig, timeout: Duration) -> Self {
        Self {
            orchestrator,
            config,
            timeout,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Identity variables every tenant container receives.
    pub fn identity_env(&self, ns: &TenantNamespace, tenant: &TenantRecord) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("TENANT_ID".to_string(), tenant.id.to_string()),
            ("TENANT_KIND".to_string(), tenant.kind.as_str().to_string()),
            ("TENANT_BASE_ID".to_string(), ns.base_id.clone()),
            ("TENANT_NAME".to_string(), tenant.name.clone()),
            ("DB_NAME".to_string(), ns.db_name.clone()),
            ("DB_USER".to_string(), ns.user_name.clone()),
            ("DB_PASSWORD".to_string(), ns.db_password.clone()),
            ("PORT".to_string(), self.config.internal_port.to_string()),
        ])
    }

    /// Layer the container environment: configured defaults, then `caller`,
    /// then the tenant's own overrides.
    pub fn build_environment(
        &self,
        tenant: &TenantRecord,
        caller: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = self.config.default_env.clone();
        env.extend(caller);
        env.extend(
            tenant
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    /// Image for a tenant: its own override, or the kind's default.
    pub fn image_for(&self, tenant: &TenantRecord) -> Result<String, OrchestratorError> {
        if let Some(image) = tenant.image.as_deref().filter(|i| !i.trim().is_empty()) {
            return Ok(image.to_string());
        }
        match tenant.kind {
            TenantKind::Store => Ok(self.config.store_image.clone()),
            TenantKind::Theme => Ok(self.config.theme_image.clone()),
            TenantKind::App => Err(OrchestratorError::InvalidSpec(format!(
                "app {} has no image",
                tenant.id
            ))),
        }
    }

    /// Create the tenant's service publishing on `host_port`, or bring an
    /// existing one in line with the current image, environment and port.
    ///
    /// The returned port is the one the orchestrator actually published,
    /// which wins over `host_port` when they differ.
    pub async fn launch(
        &self,
        ns: &TenantNamespace,
        tenant: &TenantRecord,
        env: BTreeMap<String, String>,
        host_port: u16,
    ) -> Result<InstanceHandle, OrchestratorError> {
        let service = ns.container_name.clone();
        let replicas = tenant.desired_replicas();
        self.track(tenant, &service, host_port, replicas, env.clone(), InstanceStatus::Starting)
            .await;

        let spec = ServiceSpec {
            name: service.clone(),
            image: self.image_for(tenant)?,
            labels: BTreeMap::from([
                (LABEL_TENANT_ID.to_string(), tenant.id.to_string()),
                (LABEL_KIND.to_string(), tenant.kind.as_str().to_string()),
            ]),
            env: env.clone(),
            replicas,
            target_port: self.config.internal_port,
            published_port: host_port,
            mounts: vec![Mount {
                source: ns.volume_source.clone(),
                target: ns.volume_target.clone(),
            }],
        };

        let existing = bounded(
            "inspect_service",
            self.timeout,
            self.orchestrator.inspect_service(&service),
        )
        .await?;

        let info = match existing {
            Some(previous) => {
                info!(
                    tenant_id = %tenant.id,
                    service = %service,
                    from_replicas = previous.replicas,
                    replicas,
                    port = host_port,
                    "Updating existing tenant service"
                );
                bounded(
                    "update_service",
                    self.timeout,
                    self.orchestrator.update_service(&spec),
                )
                .await?
            }
            None => {
                info!(
                    tenant_id = %tenant.id,
                    kind = %tenant.kind,
                    service = %service,
                    port = host_port,
                    replicas,
                    "Creating tenant service"
                );
                bounded(
                    "create_service",
                    self.timeout,
                    self.orchestrator.create_service(&spec),
                )
                .await?
            }
        };

        let port = self.actual_port(&info, host_port);
        self.track(tenant, &service, port, replicas, env, InstanceStatus::Starting)
            .await;

        Ok(InstanceHandle {
            service_name: service,
            host: self.config.host.clone(),
            port,
        })
    }

    fn actual_port(&self, info: &ServiceInfo, requested: u16) -> u16 {
        match info.published_ports.first().copied() {
            Some(actual) if actual != 0 && actual != requested => {
                warn!(
                    service = %info.name,
                    requested,
                    actual,
                    "Orchestrator published a different port than requested"
                );
                actual
            }
            _ => requested,
        }
    }

    /// Running tasks of a service as reachable backends. Empty when the
    /// service does not exist.
    pub async fn inspect(&self, service: &str) -> Result<Vec<Backend>, OrchestratorError> {
        let Some(info) = bounded(
            "inspect_service",
            self.timeout,
            self.orchestrator.inspect_service(service),
        )
        .await?
        else {
            return Ok(Vec::new());
        };

        if !info.is_running() {
            return Ok(Vec::new());
        }

        let tasks = bounded("list_tasks", self.timeout, self.orchestrator.list_tasks(service)).await?;
        let fallback_port = info.published_ports.first().copied();

        let mut backends: Vec<Backend> = tasks
            .iter()
            .filter(|t| t.is_running())
            .filter_map(|t| {
                let port = t.published_port.or(fallback_port)?;
                let host = t.node_addr.clone().unwrap_or_else(|| self.config.host.clone());
                Some(Backend::new(host, port))
            })
            .collect();
        backends.sort();
        backends.dedup();

        debug!(service, backends = backends.len(), "Inspected service");
        Ok(backends)
    }

    /// Whether the service exists with at least one replica.
    pub async fn is_running(&self, service: &str) -> Result<bool, OrchestratorError> {
        Ok(bounded(
            "inspect_service",
            self.timeout,
            self.orchestrator.inspect_service(service),
        )
        .await?
        .is_some_and(|info| info.is_running()))
    }

    /// Set the replica count. Zero stops the service without removing it.
    ///
    /// Tasks publish in host mode with at most one task per node, so
    /// replicas beyond the number of eligible nodes stay pending.
    pub async fn scale(&self, service: &str, replicas: u32) -> Result<(), OrchestratorError> {
        bounded(
            "update_replicas",
            self.timeout,
            self.orchestrator.update_replicas(service, replicas),
        )
        .await?;

        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get_mut(service) {
            instance.replicas = replicas;
            if replicas == 0 {
                instance.status = InstanceStatus::Stopped;
            }
            instance.updated_at = Utc::now();
        }

        info!(service, replicas, "Scaled service");
        Ok(())
    }

    /// Remove the service. Removing a missing service succeeds.
    pub async fn remove(&self, service: &str) -> Result<bool, OrchestratorError> {
        let removed = bounded(
            "remove_service",
            self.timeout,
            self.orchestrator.remove_service(service),
        )
        .await?;
        self.instances.write().await.remove(service);

        if removed {
            info!(service, "Removed service");
        } else {
            debug!(service, "Service already absent");
        }
        Ok(removed)
    }

    /// Services labelled as tenant services.
    pub async fn list_tenant_services(&self) -> Result<Vec<ServiceInfo>, OrchestratorError> {
        bounded(
            "list_services",
            self.timeout,
            self.orchestrator.list_services(LABEL_TENANT_ID),
        )
        .await
    }

    pub async fn status_of(&self, service: &str) -> Option<InstanceStatus> {
        self.instances.read().await.get(service).map(|i| i.status)
    }

    pub async fn set_status(&self, service: &str, status: InstanceStatus) {
        if let Some(instance) = self.instances.write().await.get_mut(service) {
            if instance.status != status {
                debug!(service, from = ?instance.status, to = ?status, "Instance status changed");
            }
            instance.status = status;
            instance.updated_at = Utc::now();
        }
    }

    pub async fn instance(&self, service: &str) -> Option<ServiceInstance> {
        self.instances.read().await.get(service).cloned()
    }

    /// Every tracked instance.
    pub async fn instances(&self) -> Vec<ServiceInstance> {
        let mut all: Vec<_> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        all
    }

    /// Register an instance about to be provisioned.
    pub async fn begin(&self, tenant: &TenantRecord, service: &str) {
        self.track(
            tenant,
            service,
            0,
            tenant.desired_replicas(),
            BTreeMap::new(),
            InstanceStatus::Provisioning,
        )
        .await;
    }

    async fn track(
        &self,
        tenant: &TenantRecord,
        service: &str,
        port: u16,
        replicas: u32,
        environment: BTreeMap<String, String>,
        status: InstanceStatus,
    ) {
        self.instances.write().await.insert(
            service.to_string(),
            ServiceInstance {
                kind: tenant.kind,
                tenant_id: tenant.id,
                service_name: service.to_string(),
                external_host: self.config.host.clone(),
                external_port: port,
                replicas,
                environment,
                status,
                updated_at: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::mock::MockOp;
    use crate::orchestrator::MockOrchestrator;
    use vitrine_namespace::NamespaceResolver;

    fn setup() -> (Arc<MockOrchestrator>, ServiceInstanceManager, NamespaceResolver) {
        let mock = Arc::new(MockOrchestrator::new());
        let config = InstanceConfig {
            default_env: BTreeMap::from([
                ("TZ".to_string(), "UTC".to_string()),
                ("LOG_LEVEL".to_string(), "info".to_string()),
            ]),
            ..Default::default()
        };
        let manager = ServiceInstanceManager::new(mock.clone(), config, Duration::from_secs(1));
        let resolver = NamespaceResolver::new("/srv/tenants", "/data", "salt");
        (mock, manager, resolver)
    }

    #[test]
    fn test_environment_layering() {
        let (_, manager, resolver) = setup();
        let tenant = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop")
            .with_env("LOG_LEVEL", "debug")
            .with_env("PORT", "8080");
        let ns = resolver.resolve(&tenant.id);

        let caller = manager.identity_env(&ns, &tenant);
        let env = manager.build_environment(&tenant, caller);

        assert_eq!(env["TZ"], "UTC");
        assert_eq!(env["LOG_LEVEL"], "debug");
        assert_eq!(env["PORT"], "8080");
        assert_eq!(env["DB_NAME"], ns.db_name);
        assert_eq!(env["TENANT_KIND"], "store");
    }

    #[test]
    fn test_app_without_image_is_invalid() {
        let (_, manager, _) = setup();
        let app = TenantRecord::new(TenantKind::App, TenantId::new(), "admin");
        assert!(matches!(
            manager.image_for(&app),
            Err(OrchestratorError::InvalidSpec(_))
        ));

        let theme = TenantRecord::new(TenantKind::Theme, TenantId::new(), "dawn");
        assert_eq!(manager.image_for(&theme).unwrap(), "vitrine/theme:latest");
    }

    #[tokio::test]
    async fn test_launch_creates_labelled_service() {
        let (mock, manager, resolver) = setup();
        let tenant = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop").with_replicas(2);
        let ns = resolver.resolve(&tenant.id);

        let handle = manager.launch(&ns, &tenant, BTreeMap::new(), 20010).await.unwrap();
        assert_eq!(handle.port, 20010);
        assert_eq!(handle.url("/__env"), "http://127.0.0.1:20010/__env");

        let spec = mock.spec_of(&ns.container_name).unwrap();
        assert_eq!(spec.replicas, 2);
        assert_eq!(spec.labels[LABEL_TENANT_ID], tenant.id.to_string());
        assert_eq!(spec.mounts[0].source, ns.volume_source);
        assert_eq!(
            manager.status_of(&ns.container_name).await,
            Some(InstanceStatus::Starting)
        );
    }

    #[tokio::test]
    async fn test_launch_uses_actual_published_port() {
        let (mock, manager, resolver) = setup();
        let tenant = TenantRecord::new(TenantKind::Theme, TenantId::new(), "dawn");
        let ns = resolver.resolve(&tenant.id);
        mock.override_published_port(&ns.container_name, 24001);

        let handle = manager.launch(&ns, &tenant, BTreeMap::new(), 20010).await.unwrap();
        assert_eq!(handle.port, 24001);
        assert_eq!(manager.instance(&ns.container_name).await.unwrap().external_port, 24001);
    }

    #[tokio::test]
    async fn test_launch_revives_stopped_service() {
        let (mock, manager, resolver) = setup();
        let tenant = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop");
        let ns = resolver.resolve(&tenant.id);

        manager.launch(&ns, &tenant, BTreeMap::new(), 20010).await.unwrap();
        manager.scale(&ns.container_name, 0).await.unwrap();
        assert!(!manager.is_running(&ns.container_name).await.unwrap());
        assert_eq!(
            manager.status_of(&ns.container_name).await,
            Some(InstanceStatus::Stopped)
        );

        manager.launch(&ns, &tenant, BTreeMap::new(), 20011).await.unwrap();
        assert_eq!(mock.replicas_of(&ns.container_name), Some(1));
        assert_eq!(mock.service_names().len(), 1);
    }

    #[tokio::test]
    async fn test_relaunch_applies_new_environment_and_image() {
        let (mock, manager, resolver) = setup();
        let tenant = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop")
            .with_env("FEATURE", "old");
        let ns = resolver.resolve(&tenant.id);
        let env = manager.build_environment(&tenant, BTreeMap::new());
        manager.launch(&ns, &tenant, env, 20010).await.unwrap();
        manager.scale(&ns.container_name, 0).await.unwrap();

        let mut tenant = tenant.with_env("FEATURE", "new");
        tenant.image = Some("vitrine/store:2".to_string());
        let env = manager.build_environment(&tenant, BTreeMap::new());
        manager.launch(&ns, &tenant, env, 20010).await.unwrap();

        let spec = mock.spec_of(&ns.container_name).unwrap();
        assert_eq!(spec.env["FEATURE"], "new");
        assert_eq!(spec.image, "vitrine/store:2");
        assert_eq!(spec.replicas, 1);
        assert_eq!(mock.service_names().len(), 1);
    }

    #[tokio::test]
    async fn test_inspect_missing_service_is_empty() {
        let (_, manager, _) = setup();
        assert!(manager.inspect("vt-nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inspect_returns_backends() {
        let (_, manager, resolver) = setup();
        let tenant = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop").with_replicas(3);
        let ns = resolver.resolve(&tenant.id);
        manager.launch(&ns, &tenant, BTreeMap::new(), 20010).await.unwrap();

        // Host-mode tasks on one host share an address; they collapse to one backend.
        let backends = manager.inspect(&ns.container_name).await.unwrap();
        assert_eq!(backends, vec![Backend::new("127.0.0.1", 20010)]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_, manager, resolver) = setup();
        let tenant = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop");
        let ns = resolver.resolve(&tenant.id);
        manager.launch(&ns, &tenant, BTreeMap::new(), 20010).await.unwrap();

        assert!(manager.remove(&ns.container_name).await.unwrap());
        assert!(!manager.remove(&ns.container_name).await.unwrap());
        assert!(manager.instance(&ns.container_name).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_bounded() {
        let (mock, manager, _) = setup();
        mock.set_delay(Some(Duration::from_secs(5)));

        assert!(matches!(
            manager.inspect("vt-slow").await,
            Err(OrchestratorError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_orchestrator_failure_surfaces() {
        let (mock, manager, resolver) = setup();
        mock.fail_on(MockOp::Create);
        let tenant = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop");
        let ns = resolver.resolve(&tenant.id);

        assert!(manager.launch(&ns, &tenant, BTreeMap::new(), 20010).await.is_err());
    }
}
