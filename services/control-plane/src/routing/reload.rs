//! Proxy validation and reload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::files::ConfigFiles;
use super::RoutingError;
use crate::orchestrator::{bounded, Orchestrator, OrchestratorError};

const VALIDATE_CMD: &[&str] = &["nginx", "-t"];
const RELOAD_CMD: &[&str] = &["nginx", "-s", "reload"];

/// Runs `nginx -t` and `nginx -s reload` inside the proxy container.
pub struct ProxyReloader {
    orchestrator: Arc<dyn Orchestrator>,
    container: String,
    timeout: Duration,
    files: Arc<ConfigFiles>,
    reloads: AtomicU64,
}

impl ProxyReloader {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        container: impl Into<String>,
        timeout: Duration,
        files: Arc<ConfigFiles>,
    ) -> Self {
        Self {
            orchestrator,
            container: container.into(),
            timeout,
            files,
            reloads: AtomicU64::new(0),
        }
    }

    /// Successful reloads so far.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    async fn exec(&self, cmd: &[&str]) -> Result<(i64, String), OrchestratorError> {
        let output = bounded(
            "proxy_exec",
            self.timeout,
            self.orchestrator.exec(&self.container, cmd),
        )
        .await?;
        Ok((output.exit_code, output.output))
    }

    /// Validate the configuration on disk.
    pub async fn validate(&self) -> Result<(), RoutingError> {
        let (code, output) = self.exec(VALIDATE_CMD).await?;
        if code != 0 {
            return Err(RoutingError::Validation { output });
        }
        Ok(())
    }

    /// Validate and reload. A failed validation rolls back every file staged
    /// since the last reload and skips the reload.
    pub async fn reload_now(&self, reason: &str) -> Result<(), RoutingError> {
        let staged = self.files.take_staged();

        match self.validate().await {
            Ok(()) => {}
            Err(RoutingError::Validation { output }) => {
                error!(reason, files = staged.len(), output = %output, "Proxy config failed validation, rolling back");
                self.files.rollback(staged).await?;
                return Err(RoutingError::Validation { output });
            }
            Err(e) => {
                // The check never ran; keep the writes staged for the next attempt.
                self.files.restage(staged);
                return Err(e);
            }
        }

        let (code, output) = match self.exec(RELOAD_CMD).await {
            Ok(result) => result,
            Err(e) => {
                self.files.restage(staged);
                return Err(e.into());
            }
        };
        if code != 0 {
            warn!(reason, output = %output, "Proxy reload command failed");
            self.files.restage(staged);
            return Err(RoutingError::Reload { output });
        }

        self.reloads.fetch_add(1, Ordering::SeqCst);
        info!(reason, files = staged.len(), "Proxy reloaded");
        Ok(())
    }
}
