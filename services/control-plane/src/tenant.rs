//! Tenant records as the control plane sees them.
//!
//! Stores, themes and global apps are one tagged type; the reconciler treats
//! every kind the same way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vitrine_namespace::{TenantId, TenantKind};
use vitrine_reconcile::DesiredState;

use crate::config::GlobalApp;

/// A tenant record read from the external data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub kind: TenantKind,
    pub id: TenantId,
    pub name: String,

    /// Custom domains routed to this tenant.
    #[serde(default)]
    pub domain_names: Vec<String>,

    /// Desired-active flag (`is_active` for stores, `is_running` for themes).
    pub is_active: bool,

    /// Theme currently rendering this store's storefront.
    #[serde(default)]
    pub current_theme_id: Option<TenantId>,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Image override; the kind's default image is used when absent.
    #[serde(default)]
    pub image: Option<String>,

    /// Tenant-specific container environment overrides.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Raw record attributes, cached in the registry as-is.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

fn default_replicas() -> u32 {
    1
}

impl TenantRecord {
    /// Create an active record with one replica and no domains.
    pub fn new(kind: TenantKind, id: TenantId, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
            domain_names: Vec::new(),
            is_active: true,
            current_theme_id: None,
            replicas: 1,
            image: None,
            environment: BTreeMap::new(),
            attributes: serde_json::Value::Null,
        }
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain_names = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn with_theme(mut self, theme_id: TenantId) -> Self {
        self.current_theme_id = Some(theme_id);
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Desired state derived from the active flag.
    pub fn desired_state(&self) -> DesiredState {
        if self.is_active {
            DesiredState::Running
        } else {
            DesiredState::Stopped
        }
    }

    /// Replicas to run when active (never zero).
    pub fn desired_replicas(&self) -> u32 {
        self.replicas.max(1)
    }

    pub fn has_custom_domains(&self) -> bool {
        self.domain_names.iter().any(|d| !d.trim().is_empty())
    }

    /// Base ID of the tenant.
    pub fn base_id(&self) -> String {
        self.id.base_id()
    }
}

impl From<&GlobalApp> for TenantRecord {
    fn from(app: &GlobalApp) -> Self {
        Self {
            kind: TenantKind::App,
            id: app.id,
            name: app.name.clone(),
            domain_names: app.domain_names.clone(),
            is_active: app.is_active,
            current_theme_id: None,
            replicas: app.replicas,
            image: Some(app.image.clone()),
            environment: app.environment.clone(),
            attributes: serde_json::json!({ "name": app.name, "source": "config" }),
        }
    }
}
