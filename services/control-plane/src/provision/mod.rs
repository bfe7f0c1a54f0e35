//! Tenant resource provisioning.
//!
//! Every tenant gets an OS user and group, a volume directory owned by them,
//! and a database role plus database. [`ProvisioningPipeline`] runs the steps
//! in order against a [`SystemProvisioner`]; "already exists" is success, so
//! provisioning the same tenant twice is harmless.
//!
//! Teardown ([`ProvisioningPipeline::deprovision`]) is best-effort: every
//! step runs and failures are collected.

mod fake;
mod system;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use vitrine_namespace::{TenantId, TenantNamespace};
use vitrine_reconcile::{ErrorContext, Outcome};

pub use fake::{InMemoryProvisioner, ProvisionStep};
pub use system::HostProvisioner;

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot chown {}: {message}", path.display())]
    Ownership { path: PathBuf, message: String },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: String,
        timeout: std::time::Duration,
    },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("{0}")]
    Injected(String),
}

/// Result of an ensure step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Created,
    AlreadyExisted,
}

/// Host capabilities needed to provision a tenant.
#[async_trait]
pub trait SystemProvisioner: Send + Sync {
    async fn ensure_group(&self, group: &str) -> Result<StepStatus, ProvisionError>;

    /// Create `user` with `group` as its primary group.
    async fn ensure_user(&self, user: &str, group: &str) -> Result<StepStatus, ProvisionError>;

    /// Add `user` to the supplementary `group`.
    async fn add_to_group(&self, user: &str, group: &str) -> Result<(), ProvisionError>;

    /// Create the volume directory owned by `user:group`, mode 0770.
    async fn ensure_volume(
        &self,
        path: &Path,
        user: &str,
        group: &str,
    ) -> Result<StepStatus, ProvisionError>;

    async fn ensure_db_role(&self, role: &str, password: &str) -> Result<StepStatus, ProvisionError>;

    async fn ensure_database(&self, database: &str, owner: &str) -> Result<StepStatus, ProvisionError>;

    async fn grant_privileges(&self, database: &str, role: &str) -> Result<(), ProvisionError>;

    /// Remove the volume directory. Missing is success.
    async fn remove_volume(&self, path: &Path) -> Result<(), ProvisionError>;

    /// Drop a database if it exists.
    async fn drop_database(&self, database: &str) -> Result<(), ProvisionError>;

    /// Drop a role if it exists.
    async fn drop_db_role(&self, role: &str) -> Result<(), ProvisionError>;

    /// Delete a user. Missing is success.
    async fn delete_user(&self, user: &str) -> Result<(), ProvisionError>;

    /// Delete a group. Missing is success.
    async fn delete_group(&self, group: &str) -> Result<(), ProvisionError>;
}

/// Ordered provisioning of tenant resources.
#[derive(Clone)]
pub struct ProvisioningPipeline {
    provisioner: Arc<dyn SystemProvisioner>,
    runtime_user: Option<String>,
}

impl ProvisioningPipeline {
    pub fn new(provisioner: Arc<dyn SystemProvisioner>, runtime_user: Option<String>) -> Self {
        Self {
            provisioner,
            runtime_user,
        }
    }

    /// Create everything the tenant needs. Stops at the first hard failure.
    pub async fn provision(&self, tenant_id: &TenantId, ns: &TenantNamespace) -> Outcome {
        let p = &self.provisioner;
        let fail = |op: &str, e: ProvisionError| {
            warn!(tenant_id = %tenant_id, operation = op, error = %e, "Provisioning step failed");
            Outcome::failure(ErrorContext::tenant(tenant_id, op, e))
        };

        // 1. identity
        match p.ensure_group(&ns.group_name).await {
            Ok(status) => log_step(tenant_id, "ensure_group", &ns.group_name, status),
            Err(e) => return fail("ensure_group", e),
        }
        match p.ensure_user(&ns.user_name, &ns.group_name).await {
            Ok(status) => log_step(tenant_id, "ensure_user", &ns.user_name, status),
            Err(e) => return fail("ensure_user", e),
        }

        // 2. memberships (best-effort)
        let mut members = vec![ns.user_name.as_str()];
        members.extend(self.runtime_user.as_deref());
        for member in members {
            if let Err(e) = p.add_to_group(member, &ns.group_name).await {
                warn!(
                    tenant_id = %tenant_id,
                    user = member,
                    group = %ns.group_name,
                    error = %e,
                    "Failed to add user to tenant group, continuing"
                );
            }
        }

        // 3. storage
        match p
            .ensure_volume(&ns.volume_source, &ns.user_name, &ns.group_name)
            .await
        {
            Ok(status) => log_step(
                tenant_id,
                "ensure_volume",
                &ns.volume_source.display().to_string(),
                status,
            ),
            Err(e) => return fail("ensure_volume", e),
        }

        // 4. database
        match p.ensure_db_role(&ns.user_name, &ns.db_password).await {
            Ok(status) => log_step(tenant_id, "ensure_db_role", &ns.user_name, status),
            Err(e) => return fail("ensure_db_role", e),
        }
        match p.ensure_database(&ns.db_name, &ns.user_name).await {
            Ok(status) => log_step(tenant_id, "ensure_database", &ns.db_name, status),
            Err(e) => return fail("ensure_database", e),
        }
        if let Err(e) = p.grant_privileges(&ns.db_name, &ns.user_name).await {
            return fail("grant_privileges", e);
        }

        info!(tenant_id = %tenant_id, base_id = %ns.base_id, "Tenant resources provisioned");
        Outcome::success()
    }

    /// Remove everything the tenant owns. Every step runs.
    pub async fn deprovision(&self, tenant_id: &TenantId, ns: &TenantNamespace) -> Outcome {
        let p = &self.provisioner;
        let mut outcome = Outcome::success();
        let mut record = |op: &str, result: Result<(), ProvisionError>| {
            if let Err(e) = result {
                warn!(tenant_id = %tenant_id, operation = op, error = %e, "Teardown step failed");
                outcome.record(ErrorContext::tenant(tenant_id, op, e));
            }
        };

        record("remove_volume", p.remove_volume(&ns.volume_source).await);
        record("drop_database", p.drop_database(&ns.db_name).await);
        record("drop_db_role", p.drop_db_role(&ns.user_name).await);
        record("delete_user", p.delete_user(&ns.user_name).await);
        record("delete_group", p.delete_group(&ns.group_name).await);

        if outcome.is_ok() {
            info!(tenant_id = %tenant_id, base_id = %ns.base_id, "Tenant resources removed");
        }
        outcome
    }
}

fn log_step(tenant_id: &TenantId, step: &str, target: &str, status: StepStatus) {
    match status {
        StepStatus::Created => info!(tenant_id = %tenant_id, step, target, "Created"),
        StepStatus::AlreadyExisted => debug!(tenant_id = %tenant_id, step, target, "Already exists"),
    }
}

/// Quote a Postgres identifier. Names here are derived (`vt_{hex}`), but the
/// check keeps anything unexpected out of DDL.
pub(crate) fn quote_ident(name: &str) -> Result<String, ProvisionError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ProvisionError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}
