//! # vitrine-namespace
//!
//! Tenant identifiers and the names derived from them.
//!
//! ## Design Principles
//!
//! - Every per-tenant resource name (OS user and group, database, container,
//!   volume directory) is derived from the tenant's base ID
//! - Derivation is pure: same base ID and resolver settings, same names
//! - No lookup table is needed to find a tenant's resources again, which is
//!   what makes provisioning idempotent
//!
//! ## Naming
//!
//! For tenant `1f0c2a9e-7b1d-4c1e-9a5b-3d2e1f0a9b8c` the base ID is
//! `1f0c2a9e` and:
//!
//! - user, group and database: `vt_1f0c2a9e`
//! - container service: `vt-1f0c2a9e`
//! - volume: `{volume_root}/1f0c2a9e`, mounted at `{volume_target}`

mod error;
mod types;

use std::path::PathBuf;

use serde::Serialize;
use sha2::{Digest, Sha256};

pub use error::IdError;
pub use types::{TenantId, TenantKind};

/// Prefix shared by OS users, groups and databases.
pub const NAME_PREFIX: &str = "vt_";

/// Prefix for orchestrator service names.
pub const SERVICE_PREFIX: &str = "vt-";

/// All resource names derived for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantNamespace {
    pub base_id: String,
    pub user_name: String,
    pub group_name: String,
    pub db_name: String,
    #[serde(skip_serializing)]
    pub db_password: String,
    pub container_name: String,
    pub volume_source: PathBuf,
    pub volume_target: String,
}

/// Derives [`TenantNamespace`]s from tenant IDs.
#[derive(Debug, Clone)]
pub struct NamespaceResolver {
    volume_root: PathBuf,
    volume_target: String,
    password_salt: String,
}

impl NamespaceResolver {
    /// Create a resolver.
    pub fn new(
        volume_root: impl Into<PathBuf>,
        volume_target: impl Into<String>,
        password_salt: impl Into<String>,
    ) -> Self {
        Self {
            volume_root: volume_root.into(),
            volume_target: volume_target.into(),
            password_salt: password_salt.into(),
        }
    }

    /// Root directory holding every tenant's volume directory.
    pub fn volume_root(&self) -> &std::path::Path {
        &self.volume_root
    }

    /// Resolve the namespace of a tenant.
    pub fn resolve(&self, tenant_id: &TenantId) -> TenantNamespace {
        self.resolve_base(&tenant_id.base_id())
    }

    /// Resolve a namespace from a base ID directly.
    pub fn resolve_base(&self, base_id: &str) -> TenantNamespace {
        let name = format!("{NAME_PREFIX}{base_id}");

        TenantNamespace {
            base_id: base_id.to_string(),
            user_name: name.clone(),
            group_name: name.clone(),
            db_name: name,
            db_password: self.db_password(base_id),
            container_name: format!("{SERVICE_PREFIX}{base_id}"),
            volume_source: self.volume_root.join(base_id),
            volume_target: self.volume_target.clone(),
        }
    }

    fn db_password(&self, base_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.password_salt.as_bytes());
        hasher.update(b":");
        hasher.update(base_id.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn resolver() -> NamespaceResolver {
        NamespaceResolver::new("/srv/tenants", "/data", "salt")
    }

    #[test]
    fn test_resolve_names() {
        let id = TenantId::parse("1f0c2a9e-7b1d-4c1e-9a5b-3d2e1f0a9b8c").unwrap();
        let ns = resolver().resolve(&id);

        assert_eq!(ns.base_id, "1f0c2a9e");
        assert_eq!(ns.user_name, "vt_1f0c2a9e");
        assert_eq!(ns.group_name, "vt_1f0c2a9e");
        assert_eq!(ns.db_name, "vt_1f0c2a9e");
        assert_eq!(ns.container_name, "vt-1f0c2a9e");
        assert_eq!(ns.volume_source, PathBuf::from("/srv/tenants/1f0c2a9e"));
        assert_eq!(ns.volume_target, "/data");
        assert_eq!(ns.db_password.len(), 32);
    }

    #[test]
    fn test_password_depends_on_salt() {
        let id = TenantId::new();
        let a = resolver().resolve(&id);
        let b = NamespaceResolver::new("/srv/tenants", "/data", "other").resolve(&id);
        assert_ne!(a.db_password, b.db_password);
        assert_eq!(a.db_name, b.db_name);
    }

    #[test]
    fn test_password_not_serialized() {
        let ns = resolver().resolve(&TenantId::new());
        let json = serde_json::to_value(&ns).unwrap();
        assert!(json.get("db_password").is_none());
    }

    proptest! {
        #[test]
        fn prop_resolve_is_deterministic(bytes in any::<[u8; 16]>()) {
            let id = TenantId::from_uuid(uuid::Uuid::from_bytes(bytes));
            prop_assert_eq!(resolver().resolve(&id), resolver().resolve(&id));
        }

        #[test]
        fn prop_suffix_does_not_matter(head in any::<[u8; 4]>(), a in any::<[u8; 12]>(), b in any::<[u8; 12]>()) {
            let mut left = [0u8; 16];
            let mut right = [0u8; 16];
            left[..4].copy_from_slice(&head);
            right[..4].copy_from_slice(&head);
            left[4..].copy_from_slice(&a);
            right[4..].copy_from_slice(&b);

            let left = TenantId::from_uuid(uuid::Uuid::from_bytes(left));
            let right = TenantId::from_uuid(uuid::Uuid::from_bytes(right));
            prop_assert_eq!(resolver().resolve(&left), resolver().resolve(&right));
        }
    }
}
