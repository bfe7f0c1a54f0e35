//! Background workers.
//!
//! The sync worker converges the fleet on boot (after a short delay) and
//! then periodically; the GC worker removes orphaned artifacts. Both stop
//! when the shutdown channel flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::config::WorkerConfig;
use crate::reconciler::Reconciler;

/// Periodic synchronization worker.
pub struct SyncWorker {
    reconciler: Arc<Reconciler>,
    boot_delay: Duration,
    interval: Duration,
}

impl SyncWorker {
    pub fn new(reconciler: Arc<Reconciler>, config: &WorkerConfig) -> Self {
        Self {
            reconciler,
            boot_delay: config.boot_sync_delay,
            interval: config.sync_interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            boot_delay_secs = self.boot_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting sync worker"
        );

        // Boot sync once dependencies have had a moment to come up.
        tokio::select! {
            _ = tokio::time::sleep(self.boot_delay) => self.run_pass("boot").await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Sync worker shutting down");
                    return;
                }
            }
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_pass("periodic").await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sync worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_pass(&self, trigger: &str) {
        let mut outcome = self.reconciler.synchronize_periodic().await;
        outcome.merge(self.reconciler.flush().await);
        if outcome.is_ok() {
            info!(trigger, "Sync pass complete");
        } else {
            warn!(trigger, errors = outcome.error_count(), summary = %outcome, "Sync pass finished with errors");
        }
    }
}

/// Periodic garbage collection worker.
pub struct GcWorker {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl GcWorker {
    pub fn new(reconciler: Arc<Reconciler>, config: &WorkerConfig) -> Self {
        Self {
            reconciler,
            interval: config.gc_interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting gc worker");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut outcome = self.reconciler.garbage_collect().await;
                    outcome.merge(self.reconciler.flush().await);
                    if !outcome.is_ok() {
                        warn!(errors = outcome.error_count(), summary = %outcome, "Garbage collection finished with errors");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Gc worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::StaticTenantSource;
    use crate::orchestrator::MockOrchestrator;
    use crate::provision::InMemoryProvisioner;

    fn reconciler(root: &std::path::Path) -> Arc<Reconciler> {
        let mut config = Config::default();
        config.tenancy.volume_root = root.join("volumes");
        config.proxy.available_dir = root.join("available");
        config.proxy.enabled_dir = root.join("enabled");
        config.proxy.reload_cooldown = Duration::from_millis(10);
        Arc::new(Reconciler::assemble(
            &config,
            Arc::new(StaticTenantSource::default()),
            Arc::new(MockOrchestrator::new()),
            Arc::new(InMemoryProvisioner::new()),
        ))
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = reconciler(dir.path());
        let config = WorkerConfig {
            boot_sync_delay: Duration::from_millis(1),
            sync_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(60),
            ..WorkerConfig::default()
        };

        let (tx, rx) = watch::channel(false);
        let sync = SyncWorker::new(Arc::clone(&reconciler), &config);
        let gc = GcWorker::new(Arc::clone(&reconciler), &config);
        let sync_rx = rx.clone();
        let sync_handle = tokio::spawn(async move { sync.run(sync_rx).await });
        let gc_handle = tokio::spawn(async move { gc.run(rx).await });

        // Let the boot sync write the platform file.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), sync_handle)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), gc_handle)
            .await
            .unwrap()
            .unwrap();
        assert!(dir.path().join("available/platform.conf").exists());
    }
}
