//! Administrative commands.
//!
//! One entry point per operator action. Every command resolves to an
//! [`Outcome`] so callers can report partial failures uniformly.

use std::str::FromStr;

use vitrine_namespace::{IdError, TenantId, TenantKind};
use vitrine_reconcile::{ErrorContext, Outcome};

use crate::reconciler::Reconciler;

/// A group selector: one kind, or every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSelector(pub Option<TenantKind>);

impl FromStr for KindSelector {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Self(None));
        }
        s.parse().map(|kind| Self(Some(kind)))
    }
}

/// An operator action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Sync,
    Gc,
    Start { kind: TenantKind, id: TenantId },
    Stop { kind: TenantKind, id: TenantId },
    Restart { kind: TenantKind, id: TenantId },
    Delete { id: TenantId },
    Scale { kind: TenantKind, id: TenantId, replicas: u32 },
    GroupStart(KindSelector),
    GroupStop(KindSelector),
}

impl AdminCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Gc => "gc",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Restart { .. } => "restart",
            Self::Delete { .. } => "delete",
            Self::Scale { .. } => "scale",
            Self::GroupStart(_) => "group-start",
            Self::GroupStop(_) => "group-stop",
        }
    }
}

/// Run `command` and wait for the proxy reloads it caused.
pub async fn execute(reconciler: &Reconciler, command: AdminCommand) -> Outcome {
    let mut outcome = match command {
        AdminCommand::Sync => reconciler.synchronize().await,
        AdminCommand::Gc => reconciler.garbage_collect().await,
        AdminCommand::Start { kind, id } => match load(reconciler, kind, &id).await {
            Ok(tenant) => reconciler.provision_and_run(&tenant).await,
            Err(outcome) => outcome,
        },
        AdminCommand::Stop { kind, id } => match load(reconciler, kind, &id).await {
            Ok(tenant) => reconciler.stop(&tenant).await,
            Err(outcome) => outcome,
        },
        AdminCommand::Restart { kind, id } => match load(reconciler, kind, &id).await {
            Ok(tenant) => reconciler.restart(&tenant).await,
            Err(outcome) => outcome,
        },
        // The record may already be gone; deletion works from the ID alone.
        AdminCommand::Delete { id } => reconciler.delete(&id).await,
        AdminCommand::Scale { kind, id, replicas } => reconciler.scale(kind, &id, replicas).await,
        AdminCommand::GroupStart(KindSelector(kind)) => reconciler.start_group(kind).await,
        AdminCommand::GroupStop(KindSelector(kind)) => reconciler.stop_group(kind).await,
    };
    outcome.merge(reconciler.flush().await);
    outcome
}

async fn load(
    reconciler: &Reconciler,
    kind: TenantKind,
    id: &TenantId,
) -> Result<crate::tenant::TenantRecord, Outcome> {
    match reconciler.find(kind, id).await? {
        Some(tenant) => Ok(tenant),
        None => Err(Outcome::failure(ErrorContext::tenant(
            id,
            "load_tenant",
            format!("{kind} not found"),
        ))),
    }
}
