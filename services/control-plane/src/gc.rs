//! Garbage collection of tenant artifacts nobody owns any more.
//!
//! Volume directories, proxy config files and labelled orchestrator services
//! are matched by base ID against the known tenants. Anything unmatched and
//! not allow-listed is removed.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vitrine_namespace::TenantId;
use vitrine_reconcile::{ErrorContext, Outcome};

use crate::instance::ServiceInstanceManager;
use crate::routing::{ConfigFiles, PLATFORM_FILE};

/// Garbage collector.
pub struct GarbageCollector {
    volume_root: PathBuf,
    files: Arc<ConfigFiles>,
    instances: Arc<ServiceInstanceManager>,
    allow: HashSet<String>,
}

impl GarbageCollector {
    pub fn new(
        volume_root: impl Into<PathBuf>,
        files: Arc<ConfigFiles>,
        instances: Arc<ServiceInstanceManager>,
        allow: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut allow: HashSet<String> = allow.into_iter().collect();
        allow.insert(PLATFORM_FILE.to_string());
        Self {
            volume_root: volume_root.into(),
            files,
            instances,
            allow,
        }
    }

    fn keeps(&self, name: &str, known: &HashSet<String>) -> bool {
        let stem = name.strip_suffix(".conf").unwrap_or(name);
        self.allow.contains(name) || self.allow.contains(stem) || known.contains(stem)
    }

    /// Remove everything not owned by one of the `known` base IDs.
    pub async fn collect(&self, known: &HashSet<String>) -> Outcome {
        let mut outcome = Outcome::success();
        let mut removed = 0usize;

        // Volumes
        match list_names(&self.volume_root).await {
            Ok(names) => {
                for name in names.iter().filter(|n| !self.keeps(n, known)) {
                    let path = self.volume_root.join(name);
                    warn!(path = %path.display(), "Removing orphaned volume");
                    match remove_path(&path).await {
                        Ok(()) => removed += 1,
                        Err(e) => outcome.record(ErrorContext::platform(
                            "gc.volume",
                            format!("{}: {e}", path.display()),
                        )),
                    }
                }
            }
            Err(e) => outcome.record(ErrorContext::platform(
                "gc.volume",
                format!("{}: {e}", self.volume_root.display()),
            )),
        }

        // Proxy config files (available and enabled)
        let mut config_names = Vec::new();
        for listing in [self.files.list_available().await, self.files.list_enabled().await] {
            match listing {
                Ok(names) => config_names.extend(names),
                Err(e) => outcome.record(ErrorContext::platform("gc.config", e)),
            }
        }
        config_names.sort();
        config_names.dedup();
        for name in config_names.iter().filter(|n| !self.keeps(n, known)) {
            warn!(file = %name, "Removing orphaned proxy config");
            match self.files.remove(name).await {
                Ok(_) => removed += 1,
                Err(e) => outcome.record(ErrorContext::platform("gc.config", e)),
            }
        }

        // Labelled services
        match self.instances.list_tenant_services().await {
            Ok(services) => {
                for service in services {
                    let owner = service
                        .tenant_label()
                        .and_then(|label| TenantId::parse(label).ok())
                        .map(|id| id.base_id());
                    if owner.as_ref().is_some_and(|base| known.contains(base)) {
                        continue;
                    }

                    warn!(service = %service.name, owner = ?owner, "Removing orphaned service");
                    match self.instances.remove(&service.name).await {
                        Ok(_) => removed += 1,
                        Err(e) => outcome.record(ErrorContext::platform(
                            "gc.service",
                            format!("{}: {e}", service.name),
                        )),
                    }
                }
            }
            Err(e) => outcome.record(ErrorContext::platform("gc.service", e)),
        }

        if removed > 0 || !outcome.is_ok() {
            info!(removed, errors = outcome.error_count(), "Garbage collection finished");
        } else {
            debug!("Garbage collection found nothing to remove");
        }
        outcome
    }
}

async fn list_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
