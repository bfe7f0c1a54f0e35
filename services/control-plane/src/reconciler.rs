//! Reconciliation orchestrator.
//!
//! Drives each tenant through provisioning, launch, readiness, registry and
//! routing, and converges the whole fleet against the tenant records. Every
//! operation returns an [`Outcome`]; a failure in one tenant never stops the
//! others.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use vitrine_namespace::{NamespaceResolver, TenantId, TenantKind};
use vitrine_reconcile::{plan_action, ErrorContext, Outcome, ReconcileAction, RetryTracker};

use crate::config::{Config, ProbeConfig};
use crate::db::TenantSource;
use crate::gc::GarbageCollector;
use crate::instance::{InstanceStatus, ServiceInstanceManager};
use crate::orchestrator::Orchestrator;
use crate::ports::PortAllocator;
use crate::probe::ReadinessProber;
use crate::provision::{ProvisioningPipeline, SystemProvisioner};
use crate::registry::ServiceRegistry;
use crate::routing::{ConfigFiles, ProxyReloader, RoutingSubsystem};
use crate::tenant::TenantRecord;

/// Environment keys a ready instance must echo back.
const PROBE_KEYS: &[&str] = &["TENANT_ID", "TENANT_KIND", "DB_NAME"];

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub port_range_start: u16,
    pub port_lease_ttl: Duration,
    pub probe: ProbeConfig,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_window: Duration,
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            port_range_start: config.instances.port_range_start,
            port_lease_ttl: config.instances.port_lease_ttl,
            probe: config.probe.clone(),
            max_concurrency: config.workers.max_concurrency.max(1),
            max_retries: vitrine_reconcile::DEFAULT_MAX_RETRIES,
            retry_window: vitrine_reconcile::DEFAULT_RETRY_WINDOW,
        }
    }
}

/// The collaborators a [`Reconciler`] drives.
pub struct Components {
    pub source: Arc<dyn TenantSource>,
    pub resolver: NamespaceResolver,
    pub ports: PortAllocator,
    pub instances: Arc<ServiceInstanceManager>,
    pub pipeline: ProvisioningPipeline,
    pub prober: ReadinessProber,
    pub registry: Arc<ServiceRegistry>,
    pub routing: Arc<RoutingSubsystem>,
    pub gc: GarbageCollector,
}

/// Public control surface of the control plane.
pub struct Reconciler {
    source: Arc<dyn TenantSource>,
    resolver: NamespaceResolver,
    ports: PortAllocator,
    instances: Arc<ServiceInstanceManager>,
    pipeline: ProvisioningPipeline,
    prober: ReadinessProber,
    registry: Arc<ServiceRegistry>,
    routing: Arc<RoutingSubsystem>,
    gc: GarbageCollector,
    settings: ReconcilerSettings,
    retries: Mutex<RetryTracker>,
    permits: Arc<Semaphore>,
}

impl Reconciler {
    pub fn new(components: Components, settings: ReconcilerSettings) -> Self {
        Self {
            source: components.source,
            resolver: components.resolver,
            ports: components.ports,
            instances: components.instances,
            pipeline: components.pipeline,
            prober: components.prober,
            registry: components.registry,
            routing: components.routing,
            gc: components.gc,
            retries: Mutex::new(RetryTracker::new(settings.max_retries, settings.retry_window)),
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            settings,
        }
    }

    /// Wire every component from configuration.
    pub fn assemble(
        config: &Config,
        source: Arc<dyn TenantSource>,
        orchestrator: Arc<dyn Orchestrator>,
        provisioner: Arc<dyn SystemProvisioner>,
    ) -> Self {
        let tenancy = &config.tenancy;
        let resolver = NamespaceResolver::new(
            tenancy.volume_root.clone(),
            tenancy.volume_target.clone(),
            tenancy.password_salt.clone(),
        );
        let instances = Arc::new(ServiceInstanceManager::new(
            Arc::clone(&orchestrator),
            config.instances.clone(),
            config.call_timeout,
        ));
        let registry = Arc::new(ServiceRegistry::new(config.registry_ttl));
        let files = Arc::new(ConfigFiles::new(
            config.proxy.available_dir.clone(),
            config.proxy.enabled_dir.clone(),
        ));
        let reloader = Arc::new(ProxyReloader::new(
            orchestrator,
            config.proxy.container.clone(),
            config.call_timeout,
            Arc::clone(&files),
        ));
        let routing = Arc::new(RoutingSubsystem::new(
            Arc::clone(&source),
            Arc::clone(&instances),
            Arc::clone(&registry),
            resolver.clone(),
            Arc::clone(&files),
            reloader,
            config.proxy.platform_domain.clone(),
            config.proxy.reload_cooldown,
        ));
        let gc = GarbageCollector::new(
            tenancy.volume_root.clone(),
            files,
            Arc::clone(&instances),
            config.workers.gc_allow.clone(),
        );

        Self::new(
            Components {
                source,
                resolver,
                ports: PortAllocator::default(),
                instances,
                pipeline: ProvisioningPipeline::new(provisioner, tenancy.runtime_user.clone()),
                prober: ReadinessProber::new(config.probe.request_timeout),
                registry,
                routing,
                gc,
            },
            ReconcilerSettings::from_config(config),
        )
    }

    pub fn instances(&self) -> &Arc<ServiceInstanceManager> {
        &self.instances
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<RoutingSubsystem> {
        &self.routing
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn resolver(&self) -> &NamespaceResolver {
        &self.resolver
    }

    fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look a tenant up in the tenant source.
    pub async fn find(&self, kind: TenantKind, id: &TenantId) -> Result<Option<TenantRecord>, Outcome> {
        self.source.find_tenant(kind, id).await.map_err(|e| {
            Outcome::failure(ErrorContext::tenant(id, "load_tenant", e))
        })
    }

    /// Provision, launch, verify and route one tenant.
    pub async fn provision_and_run(&self, tenant: &TenantRecord) -> Outcome {
        self.launch_tenant(tenant, true).await
    }

    async fn launch_tenant(&self, tenant: &TenantRecord, commit_routing: bool) -> Outcome {
        let ns = self.resolver.resolve(&tenant.id);
        let service = ns.container_name.clone();
        let fail = |op: &str, cause: String| {
            warn!(tenant_id = %tenant.id, kind = %tenant.kind, operation = op, error = %cause, "Tenant launch failed");
            Outcome::failure(ErrorContext::tenant(tenant.id, op, cause))
        };

        info!(tenant_id = %tenant.id, kind = %tenant.kind, service = %service, "Provisioning tenant");
        self.instances.begin(tenant, &service).await;

        let provisioned = self.pipeline.provision(&tenant.id, &ns).await;
        if !provisioned.is_ok() {
            self.instances.set_status(&service, InstanceStatus::Failed).await;
            return provisioned;
        }

        let reserved = match self.claim_port(&service).await {
            Ok(port) => port,
            Err(cause) => {
                self.instances.set_status(&service, InstanceStatus::Failed).await;
                return fail("reserve_port", cause);
            }
        };

        let env = self
            .instances
            .build_environment(tenant, self.instances.identity_env(&ns, tenant));
        let expected: BTreeMap<String, String> = PROBE_KEYS
            .iter()
            .filter_map(|key| env.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();

        let handle = match self.instances.launch(&ns, tenant, env, reserved).await {
            Ok(handle) => handle,
            Err(e) => {
                self.ports.release(reserved);
                self.instances.set_status(&service, InstanceStatus::Failed).await;
                return fail("launch", e.to_string());
            }
        };

        self.instances.set_status(&service, InstanceStatus::Testing).await;
        let probe = &self.settings.probe;
        let ready = self
            .prober
            .probe(
                &handle.url(&probe.path),
                &expected,
                probe.interval,
                probe.max_attempts,
            )
            .await;
        self.ports.release(reserved);

        if !ready.ok {
            // Leave it stopped so the next pass launches and probes again.
            if let Err(e) = self.instances.scale(&service, 0).await {
                warn!(service = %service, error = %e, "Failed to stop unready service");
            }
            self.instances.set_status(&service, InstanceStatus::Failed).await;
            return fail(
                "readiness",
                format!(
                    "not ready after {} attempts: {}",
                    ready.attempts,
                    ready.last_error.unwrap_or_default()
                ),
            );
        }

        self.instances.set_status(&service, InstanceStatus::Healthy).await;
        self.remember(tenant).await;

        let mut outcome = Outcome::success();
        match self.routing.update_tenant(tenant).await {
            Ok(changed) => {
                let changed = changed | self.refresh_dependents(tenant, &mut outcome).await;
                if commit_routing {
                    if let Err(e) = self.routing.commit(changed, &format!("launch {}", tenant.id)).await {
                        outcome.merge(fail("routing", e.to_string()));
                    }
                }
            }
            Err(e) => outcome.merge(fail("routing", e.to_string())),
        }

        if outcome.is_ok() {
            info!(
                tenant_id = %tenant.id,
                kind = %tenant.kind,
                service = %service,
                port = handle.port,
                "Tenant running"
            );
        }
        outcome
    }

    /// Lease the host port `service` should publish on: the one it already
    /// publishes, or a free one no other tenant service publishes.
    async fn claim_port(&self, service: &str) -> Result<u16, String> {
        let services = self
            .instances
            .list_tenant_services()
            .await
            .map_err(|e| e.to_string())?;

        let mut taken = BTreeSet::new();
        let mut current = None;
        for info in services {
            if info.name == service {
                current = info.published_ports.first().copied().filter(|p| *p != 0);
            } else {
                taken.extend(info.published_ports.iter().copied());
            }
        }

        let ttl = self.settings.port_lease_ttl;
        if let Some(port) = current {
            if self.ports.try_lease(port, ttl).is_ok() {
                debug!(service, port, "Keeping published port");
                return Ok(port);
            }
        }
        self.ports
            .reserve_avoiding(self.settings.port_range_start, ttl, &taken)
            .await
            .map_err(|e| e.to_string())
    }

    async fn remember(&self, tenant: &TenantRecord) {
        self.registry.put_tenant(tenant.id, tenant.attributes.clone()).await;
        self.registry.put_name(tenant.name.clone(), tenant.id).await;
    }

    /// Stores rendered by `theme` follow its backends.
    async fn refresh_dependents(&self, tenant: &TenantRecord, outcome: &mut Outcome) -> bool {
        if tenant.kind != TenantKind::Theme {
            return false;
        }

        let listing = match self.source.list_tenants().await {
            Ok(listing) => listing,
            Err(e) => {
                outcome.record(ErrorContext::tenant(tenant.id, "load_dependents", e));
                return false;
            }
        };

        let mut changed = false;
        for store in listing
            .records
            .iter()
            .filter(|t| t.kind == TenantKind::Store && t.current_theme_id == Some(tenant.id))
        {
            match self.routing.update_tenant(store).await {
                Ok(c) => changed |= c,
                Err(e) => outcome.record(ErrorContext::tenant(store.id, "routing", e)),
            }
        }
        changed
    }

    /// Scale to zero and withdraw routes.
    pub async fn stop(&self, tenant: &TenantRecord) -> Outcome {
        self.stop_tenant(tenant, true).await
    }

    async fn stop_tenant(&self, tenant: &TenantRecord, commit_routing: bool) -> Outcome {
        let service = self.resolver.resolve(&tenant.id).container_name;
        let mut outcome = Outcome::success();

        match self.instances.is_running(&service).await {
            Ok(true) => {
                if let Err(e) = self.instances.scale(&service, 0).await {
                    outcome.record(ErrorContext::tenant(tenant.id, "stop", e));
                    return outcome;
                }
            }
            Ok(false) => debug!(service = %service, "Service already stopped"),
            Err(e) => {
                outcome.record(ErrorContext::tenant(tenant.id, "stop", e));
                return outcome;
            }
        }
        self.instances.set_status(&service, InstanceStatus::Stopped).await;

        match self.routing.update_tenant(tenant).await {
            Ok(changed) => {
                let changed = changed | self.refresh_dependents(tenant, &mut outcome).await;
                if commit_routing {
                    if let Err(e) = self.routing.commit(changed, &format!("stop {}", tenant.id)).await {
                        outcome.record(ErrorContext::tenant(tenant.id, "routing", e));
                    }
                }
            }
            Err(e) => outcome.record(ErrorContext::tenant(tenant.id, "routing", e)),
        }

        info!(tenant_id = %tenant.id, kind = %tenant.kind, "Tenant stopped");
        outcome
    }

    /// Stop, then provision and run.
    pub async fn restart(&self, tenant: &TenantRecord) -> Outcome {
        let mut outcome = self.stop(tenant).await;
        outcome.merge(self.provision_and_run(tenant).await);
        outcome
    }

    /// Remove the tenant's service, resources, registry entries and routes.
    /// Every step runs.
    pub async fn delete(&self, tenant_id: &TenantId) -> Outcome {
        let ns = self.resolver.resolve(tenant_id);
        let mut outcome = Outcome::success();

        if let Err(e) = self.instances.remove(&ns.container_name).await {
            outcome.record(ErrorContext::tenant(tenant_id, "remove_service", e));
        }
        outcome.merge(self.pipeline.deprovision(tenant_id, &ns).await);
        self.registry.invalidate(tenant_id).await;
        if let Err(e) = self.routing.remove_tenant(tenant_id).await {
            outcome.record(ErrorContext::tenant(tenant_id, "remove_routes", e));
        }

        info!(tenant_id = %tenant_id, ok = outcome.is_ok(), "Tenant deleted");
        outcome
    }

    /// Set a tenant's replica count; zero stops it.
    pub async fn scale(&self, kind: TenantKind, tenant_id: &TenantId, replicas: u32) -> Outcome {
        let tenant = match self.find(kind, tenant_id).await {
            Ok(Some(tenant)) => tenant.with_replicas(replicas),
            Ok(None) => {
                return Outcome::failure(ErrorContext::tenant(tenant_id, "scale", "tenant not found"))
            }
            Err(outcome) => return outcome,
        };

        if replicas == 0 {
            return self.stop(&tenant).await;
        }

        let service = self.resolver.resolve(tenant_id).container_name;
        match self.instances.is_running(&service).await {
            Ok(true) => {
                if let Err(e) = self.instances.scale(&service, replicas).await {
                    return Outcome::failure(ErrorContext::tenant(tenant_id, "scale", e));
                }
                match self.routing.refresh(&tenant).await {
                    Ok(_) => Outcome::success(),
                    Err(e) => Outcome::failure(ErrorContext::tenant(tenant_id, "routing", e)),
                }
            }
            Ok(false) => self.provision_and_run(&tenant).await,
            Err(e) => Outcome::failure(ErrorContext::tenant(tenant_id, "scale", e)),
        }
    }

    /// Provision and run every tenant of `kind` (all kinds when `None`).
    pub async fn start_group(&self, kind: Option<TenantKind>) -> Outcome {
        let listing = match self.source.list_tenants().await {
            Ok(listing) => listing,
            Err(e) => return Outcome::failure(ErrorContext::platform("start_group", e)),
        };

        let mut outcome = listing.outcome(kind);
        for phase in phases(listing.records, kind) {
            outcome.merge(self.bounded(phase, |t| async move { self.launch_tenant(&t, false).await }).await);
        }
        outcome.merge(self.commit_all("start_group").await);
        outcome
    }

    /// Stop every tenant of `kind` (all kinds when `None`).
    pub async fn stop_group(&self, kind: Option<TenantKind>) -> Outcome {
        let listing = match self.source.list_tenants().await {
            Ok(listing) => listing,
            Err(e) => return Outcome::failure(ErrorContext::platform("stop_group", e)),
        };

        let mut outcome = listing.outcome(kind);
        for phase in phases(listing.records, kind) {
            outcome.merge(self.bounded(phase, |t| async move { self.stop_tenant(&t, false).await }).await);
        }
        outcome.merge(self.commit_all("stop_group").await);
        outcome
    }

    /// Converge every tenant against its record.
    pub async fn synchronize(&self) -> Outcome {
        self.sync_pass(false).await
    }

    /// Periodic variant: tenants that keep failing are skipped until their
    /// retry window passes.
    pub async fn synchronize_periodic(&self) -> Outcome {
        self.sync_pass(true).await
    }

    async fn sync_pass(&self, honour_retries: bool) -> Outcome {
        let listing = match self.source.list_tenants().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "Cannot load tenants, skipping synchronization");
                return Outcome::failure(ErrorContext::platform("synchronize", e));
            }
        };
        info!(
            tenants = listing.records.len(),
            rejected = listing.rejected.len(),
            "Synchronizing tenants"
        );
        self.retries().prune();

        let mut outcome = listing.outcome(None);
        for phase in phases(listing.records, None) {
            outcome.merge(
                self.bounded(phase, |t| async move { self.sync_tenant(&t, honour_retries).await })
                    .await,
            );
        }
        outcome.merge(self.commit_all("synchronize").await);
        self.registry.purge_expired().await;

        info!(ok = outcome.is_ok(), errors = outcome.error_count(), "Synchronization finished");
        outcome
    }

    async fn sync_tenant(&self, tenant: &TenantRecord, honour_retries: bool) -> Outcome {
        let key = tenant.id.to_string();
        if honour_retries && self.retries().is_exhausted(&key) {
            debug!(tenant_id = %tenant.id, "Retries exhausted, skipping until window passes");
            return Outcome::success();
        }

        let service = self.resolver.resolve(&tenant.id).container_name;
        let running = match self.instances.is_running(&service).await {
            Ok(running) => running,
            Err(e) => return Outcome::failure(ErrorContext::tenant(tenant.id, "inspect", e)),
        };

        let outcome = match plan_action(tenant.desired_state(), running) {
            ReconcileAction::Launch => self.launch_tenant(tenant, false).await,
            ReconcileAction::Stop => self.stop_tenant(tenant, false).await,
            ReconcileAction::Refresh | ReconcileAction::Nothing => {
                if running {
                    self.remember(tenant).await;
                }
                // Also rewrites domain files left behind by an earlier run.
                match self.routing.update_tenant(tenant).await {
                    Ok(_) => Outcome::success(),
                    Err(e) => Outcome::failure(ErrorContext::tenant(tenant.id, "routing", e)),
                }
            }
        };

        if outcome.is_ok() {
            self.retries().clear(&key);
        } else if self.retries().record_failure(&key) {
            warn!(tenant_id = %tenant.id, "Tenant keeps failing, backing off");
        }
        outcome
    }

    /// Rebuild the platform file; the proxy reloads when anything changed
    /// since the last reload.
    async fn commit_all(&self, reason: &str) -> Outcome {
        let pending = self.routing.files().has_staged();
        match self.routing.commit(pending, reason).await {
            Ok(_) => Outcome::success(),
            Err(e) => Outcome::failure(ErrorContext::platform("routing", e)),
        }
    }

    /// Remove artifacts of tenants that no longer exist.
    pub async fn garbage_collect(&self) -> Outcome {
        let listing = match self.source.list_tenants().await {
            Ok(listing) => listing,
            // Never collect against an unknown tenant set.
            Err(e) => return Outcome::failure(ErrorContext::platform("garbage_collect", e)),
        };
        let Some(known) = listing.known_base_ids() else {
            return listing.outcome(None).and(Outcome::failure(ErrorContext::platform(
                "garbage_collect",
                "a tenant row has no readable id, skipping collection",
            )));
        };
        self.gc.collect(&known).await
    }

    /// Wait for pending proxy reloads; reports reload failures.
    pub async fn flush(&self) -> Outcome {
        self.routing.flush().await
    }

    async fn bounded<'a, F, Fut>(&'a self, tenants: Vec<TenantRecord>, run: F) -> Outcome
    where
        F: Fn(TenantRecord) -> Fut,
        Fut: Future<Output = Outcome> + 'a,
    {
        let tasks = tenants.into_iter().map(|tenant| {
            let permits = Arc::clone(&self.permits);
            let work = run(tenant);
            async move {
                let _permit = permits.acquire_owned().await.ok();
                work.await
            }
        });
        join_all(tasks).await.into_iter().collect()
    }
}

/// Tenants grouped so apps and themes converge before the stores they serve.
fn phases(tenants: Vec<TenantRecord>, kind: Option<TenantKind>) -> Vec<Vec<TenantRecord>> {
    TenantKind::ALL
        .iter()
        .filter(|k| kind.map_or(true, |wanted| wanted == **k))
        .map(|k| tenants.iter().filter(|t| t.kind == *k).cloned().collect::<Vec<_>>())
        .filter(|phase| !phase.is_empty())
        .collect()
}
