//! Dynamic routing.
//!
//! Keeps the reverse proxy in step with what the orchestrator is actually
//! running. The registry's backend lists are the input:
//!
//! - a domain file per tenant with custom domains;
//! - one platform file with an upstream per known tenant and a path location
//!   for tenants without custom domains;
//! - debounced validate-then-reload of the proxy whenever a file changed.
//!
//! Registry misses are refilled by inspecting the serving service, so a fresh
//! process renders the same platform file as a long-running one.

pub mod files;
pub mod reload;
pub mod render;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use vitrine_namespace::{NamespaceResolver, TenantId, TenantKind};
use vitrine_reconcile::{Debouncer, ErrorContext, Outcome, Trigger};

pub use files::{ConfigFiles, FileChange, PLATFORM_FILE};
pub use reload::ProxyReloader;

use crate::db::{DbError, TenantSource};
use crate::instance::ServiceInstanceManager;
use crate::orchestrator::OrchestratorError;
use crate::registry::{Backend, ServiceRegistry};
use crate::tenant::TenantRecord;

/// Debounce key of the (single) proxy.
const PROXY_KEY: &str = "proxy";

/// Routing errors.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("cannot list tenants: {0}")]
    Tenants(#[from] DbError),

    #[error("proxy config failed validation: {output}")]
    Validation { output: String },

    #[error("proxy reload failed: {output}")]
    Reload { output: String },
}

/// Routing state of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingEntry {
    pub tenant_id: TenantId,
    pub kind: TenantKind,
    pub base_id: String,
    pub upstream_name: String,
    pub backends: Vec<Backend>,
    pub domain_names: Vec<String>,
}

impl RoutingEntry {
    pub fn new(tenant: &TenantRecord, backends: Vec<Backend>) -> Self {
        let base_id = tenant.base_id();
        Self {
            tenant_id: tenant.id,
            kind: tenant.kind,
            upstream_name: render::upstream_name(&base_id),
            base_id,
            backends,
            domain_names: tenant.domain_names.clone(),
        }
    }

    /// Domains trimmed, lowercased, sorted and deduplicated.
    pub fn normalized_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .domain_names
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        domains.sort();
        domains.dedup();
        domains
    }
}

/// Routing subsystem.
pub struct RoutingSubsystem {
    source: Arc<dyn TenantSource>,
    instances: Arc<ServiceInstanceManager>,
    registry: Arc<ServiceRegistry>,
    resolver: NamespaceResolver,
    files: Arc<ConfigFiles>,
    platform_domain: String,
    reload: Debouncer<&'static str, String>,
    reload_errors: Arc<Mutex<Vec<ErrorContext>>>,
}

impl RoutingSubsystem {
    pub fn new(
        source: Arc<dyn TenantSource>,
        instances: Arc<ServiceInstanceManager>,
        registry: Arc<ServiceRegistry>,
        resolver: NamespaceResolver,
        files: Arc<ConfigFiles>,
        reloader: Arc<ProxyReloader>,
        platform_domain: impl Into<String>,
        reload_cooldown: Duration,
    ) -> Self {
        let reload_errors = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::clone(&reload_errors);
        let reload = Debouncer::new(reload_cooldown, move |_key, reason: String| {
            let reloader = Arc::clone(&reloader);
            let errors = Arc::clone(&errors);
            async move {
                if let Err(e) = reloader.reload_now(&reason).await {
                    lock(&errors).push(ErrorContext::platform("proxy_reload", e));
                }
            }
        });

        Self {
            source,
            instances,
            registry,
            resolver,
            files,
            platform_domain: platform_domain.into(),
            reload,
            reload_errors,
        }
    }

    /// Service whose backends serve `tenant`: a store rendering a theme is
    /// served by the theme's service.
    pub fn serving_service(&self, tenant: &TenantRecord) -> String {
        match (tenant.kind, tenant.current_theme_id) {
            (TenantKind::Store, Some(theme_id)) => self.resolver.resolve(&theme_id).container_name,
            _ => self.resolver.resolve(&tenant.id).container_name,
        }
    }

    /// Inspect the serving service and overwrite the tenant's registry
    /// backends.
    pub async fn build_upstream(&self, tenant: &TenantRecord) -> Result<RoutingEntry, RoutingError> {
        let service = self.serving_service(tenant);
        let own = self.resolver.resolve(&tenant.id).container_name;
        // A stopped store is unrouted even while its theme keeps running.
        let backends = if service != own && !self.instances.is_running(&own).await? {
            Vec::new()
        } else {
            self.instances.inspect(&service).await?
        };
        self.registry.put_backends(tenant.id, backends).await;

        let entry = RoutingEntry::new(tenant, self.registry.backends(&tenant.id).await);
        debug!(
            tenant_id = %tenant.id,
            service = %service,
            backends = entry.backends.len(),
            "Built upstream"
        );
        Ok(entry)
    }

    /// Routing entry from the registry, refilling a miss from the
    /// orchestrator. A tenant whose service cannot be inspected renders
    /// without backends.
    pub async fn routed_entry(&self, tenant: &TenantRecord) -> RoutingEntry {
        if let Some(backends) = self.registry.cached_backends(&tenant.id).await {
            return RoutingEntry::new(tenant, backends);
        }
        match self.build_upstream(tenant).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(tenant_id = %tenant.id, error = %e, "Cannot refill backends, routing without");
                RoutingEntry::new(tenant, Vec::new())
            }
        }
    }

    /// Refresh one tenant's registry backends and domain file. Returns
    /// whether any file changed. The platform file is not touched; see
    /// [`commit`](Self::commit).
    pub async fn update_tenant(&self, tenant: &TenantRecord) -> Result<bool, RoutingError> {
        let entry = self.build_upstream(tenant).await?;
        let name = files::tenant_file(&entry.base_id);

        if entry.normalized_domains().is_empty() {
            return self.files.remove(&name).await;
        }
        let change = self
            .files
            .write(&name, &render::render_tenant_server(&entry))
            .await?;
        Ok(change.changed())
    }

    /// Routing entries of every known tenant.
    pub async fn entries(&self) -> Result<Vec<RoutingEntry>, RoutingError> {
        let listing = self.source.list_tenants().await?;
        if !listing.rejected.is_empty() {
            warn!(rejected = listing.rejected.len(), "Routing without undecodable tenants");
        }
        Ok(join_all(listing.records.iter().map(|t| self.routed_entry(t))).await)
    }

    /// Render the platform file from every known tenant. Nothing is written
    /// when the tenants cannot be listed.
    pub async fn build_platform_server(&self) -> Result<FileChange, RoutingError> {
        let entries = self.entries().await?;
        let content = render::render_platform(&self.platform_domain, &entries);
        self.files.write(PLATFORM_FILE, &content).await
    }

    /// Rebuild the platform file and request a reload if it or any tenant
    /// file changed. Returns whether a reload was requested.
    pub async fn commit(&self, tenant_files_changed: bool, reason: &str) -> Result<bool, RoutingError> {
        let platform_changed = self.build_platform_server().await?.changed();
        if tenant_files_changed || platform_changed {
            self.request_reload(reason);
            return Ok(true);
        }
        debug!(reason, "Routing unchanged, no reload");
        Ok(false)
    }

    /// Refresh one tenant end to end.
    pub async fn refresh(&self, tenant: &TenantRecord) -> Result<bool, RoutingError> {
        let changed = self.update_tenant(tenant).await?;
        self.commit(changed, &format!("tenant {}", tenant.id)).await
    }

    /// Drop a tenant's routes.
    pub async fn remove_tenant(&self, tenant_id: &TenantId) -> Result<bool, RoutingError> {
        let removed = self
            .files
            .remove(&files::tenant_file(&tenant_id.base_id()))
            .await?;
        info!(tenant_id = %tenant_id, "Removed tenant routes");
        self.commit(removed, &format!("remove {tenant_id}")).await
    }

    /// Request a debounced validate-and-reload.
    pub fn request_reload(&self, reason: &str) -> Trigger {
        self.reload.trigger(PROXY_KEY, reason.to_string())
    }

    /// Wait for pending reloads and report failures since the last flush.
    pub async fn flush(&self) -> Outcome {
        self.reload.wait_idle().await;
        lock(&self.reload_errors).drain(..).map(Outcome::failure).collect()
    }

    pub fn files(&self) -> &Arc<ConfigFiles> {
        &self.files
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
