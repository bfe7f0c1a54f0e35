//! Container orchestrator interface.
//!
//! The control plane runs every tenant as a replicated orchestrator service.
//! [`DockerOrchestrator`] talks to the Docker Engine API (Swarm mode) on its
//! Unix socket; [`MockOrchestrator`] keeps everything in memory for tests and
//! local development.

pub mod docker;
pub mod mock;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::DockerOrchestrator;
pub use mock::MockOrchestrator;

/// Label carrying the owning tenant's id on every tenant service.
pub const LABEL_TENANT_ID: &str = "vitrine.tenant_id";

/// Label carrying the tenant kind.
pub const LABEL_KIND: &str = "vitrine.kind";

/// Errors from the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("service already exists: {0}")]
    Conflict(String),

    #[error("orchestrator API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("orchestrator unreachable: {0}")]
    Transport(String),

    #[error("unexpected orchestrator response: {0}")]
    Decode(String),

    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("no running container matches '{0}'")]
    NoContainer(String),
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Bind mount attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
}

/// Desired shape of a tenant service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub replicas: u32,
    /// Port the process listens on inside the container.
    pub target_port: u16,
    /// Host port, published in host mode.
    pub published_port: u16,
    pub mounts: Vec<Mount>,
}

/// What the orchestrator reports about a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub replicas: u32,
    pub labels: BTreeMap<String, String>,
    pub published_ports: Vec<u16>,
    pub version: u64,
}

impl ServiceInfo {
    pub fn is_running(&self) -> bool {
        self.replicas > 0
    }

    pub fn tenant_label(&self) -> Option<&str> {
        self.labels.get(LABEL_TENANT_ID).map(String::as_str)
    }
}

/// One task (container) of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub service: String,
    /// Current task state as reported (`running`, `starting`, `failed`, ...).
    pub state: String,
    /// Address of the node running the task, when known.
    pub node_addr: Option<String>,
    /// Host port the task's internal port is published on.
    pub published_port: Option<u16>,
}

impl TaskInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Result of a command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container orchestrator interface.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create a replicated service.
    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceInfo, OrchestratorError>;

    /// Inspect a service by name. `None` when it does not exist.
    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceInfo>, OrchestratorError>;

    /// Tasks of a service. Empty when the service does not exist.
    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskInfo>, OrchestratorError>;

    /// Replace an existing service's spec (image, environment, mounts,
    /// published port and replica count).
    async fn update_service(&self, spec: &ServiceSpec) -> Result<ServiceInfo, OrchestratorError>;

    /// Set a service's replica count.
    async fn update_replicas(&self, service: &str, replicas: u32) -> Result<(), OrchestratorError>;

    /// Remove a service. Returns false when it did not exist.
    async fn remove_service(&self, service: &str) -> Result<bool, OrchestratorError>;

    /// Services carrying `label` (any value).
    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, OrchestratorError>;

    /// Run a command inside a running container whose name matches `container`.
    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput, OrchestratorError>;
}

/// Run an orchestrator call under a deadline.
pub async fn bounded<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::Timeout { operation, timeout }),
    }
}
