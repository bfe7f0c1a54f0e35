//! Service registry.
//!
//! A cache-aside view of tenant attributes, name lookups and live backends.
//! Entries are overwritten wholesale and expire after a fixed TTL; expired or
//! missing entries read as absent, and the next reconciliation pass refills
//! them from the tenant source and the orchestrator.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use vitrine_namespace::TenantId;

/// Default registry entry lifetime.
pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(3600);

/// A reachable endpoint of a tenant service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct TtlMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, (V, Instant)>,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone())
    }

    fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now() + self.ttl));
    }

    fn remove(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    fn purge(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - self.entries.len()
    }
}

/// TTL-bound registry of tenants and their backends.
pub struct ServiceRegistry {
    ttl: Duration,
    tenants: RwLock<TtlMap<TenantId, serde_json::Value>>,
    names: RwLock<TtlMap<String, TenantId>>,
    backends: RwLock<TtlMap<TenantId, Vec<Backend>>>,
}

impl ServiceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tenants: RwLock::new(TtlMap::new(ttl)),
            names: RwLock::new(TtlMap::new(ttl)),
            backends: RwLock::new(TtlMap::new(ttl)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn put_tenant(&self, id: TenantId, attributes: serde_json::Value) {
        self.tenants.write().await.insert(id, attributes);
    }

    pub async fn tenant(&self, id: &TenantId) -> Option<serde_json::Value> {
        self.tenants.read().await.get(id)
    }

    pub async fn put_name(&self, name: impl Into<String>, id: TenantId) {
        self.names.write().await.insert(name.into(), id);
    }

    pub async fn tenant_id_by_name(&self, name: &str) -> Option<TenantId> {
        self.names.read().await.get(&name.to_string())
    }

    /// Replace the backends of a tenant. Stored sorted.
    pub async fn put_backends(&self, id: TenantId, mut backends: Vec<Backend>) {
        backends.sort();
        backends.dedup();
        self.backends.write().await.insert(id, backends);
    }

    /// Live backends of a tenant; empty when unknown or expired.
    pub async fn backends(&self, id: &TenantId) -> Vec<Backend> {
        self.cached_backends(id).await.unwrap_or_default()
    }

    /// Backends of a tenant, or `None` on a cache miss so the caller can
    /// refill from the orchestrator.
    pub async fn cached_backends(&self, id: &TenantId) -> Option<Vec<Backend>> {
        self.backends.read().await.get(id)
    }

    /// Drop everything known about a tenant.
    pub async fn invalidate(&self, id: &TenantId) {
        self.tenants.write().await.remove(id);
        self.backends.write().await.remove(id);
        self.names
            .write()
            .await
            .entries
            .retain(|_, (tenant, _)| tenant != id);
        debug!(tenant_id = %id, "Invalidated registry entries");
    }

    /// Remove expired entries from every map. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let removed = self.tenants.write().await.purge()
            + self.names.write().await.purge()
            + self.backends.write().await.purge();
        if removed > 0 {
            debug!(removed, "Purged expired registry entries");
        }
        removed
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backends_sorted_and_deduped() {
        let registry = ServiceRegistry::default();
        let id = TenantId::new();
        registry
            .put_backends(
                id,
                vec![
                    Backend::new("10.0.0.2", 20001),
                    Backend::new("10.0.0.1", 20002),
                    Backend::new("10.0.0.2", 20001),
                ],
            )
            .await;

        let backends = registry.backends(&id).await;
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].address(), "10.0.0.1:20002");
    }

    #[tokio::test]
    async fn test_missing_reads_empty() {
        let registry = ServiceRegistry::default();
        let id = TenantId::new();
        assert!(registry.backends(&id).await.is_empty());
        assert!(registry.tenant(&id).await.is_none());
        assert!(registry.tenant_id_by_name("nobody").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let registry = ServiceRegistry::new(Duration::from_secs(60));
        let id = TenantId::new();
        registry.put_tenant(id, serde_json::json!({"name": "shop"})).await;
        registry.put_name("shop", id).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.tenant_id_by_name("shop").await, Some(id));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(registry.tenant(&id).await.is_none());
        assert!(registry.tenant_id_by_name("shop").await.is_none());
        assert_eq!(registry.purge_expired().await, 2);
    }

    #[tokio::test]
    async fn test_cached_backends_tells_miss_from_empty() {
        let registry = ServiceRegistry::default();
        let id = TenantId::new();
        assert!(registry.cached_backends(&id).await.is_none());

        registry.put_backends(id, Vec::new()).await;
        assert_eq!(registry.cached_backends(&id).await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_overwrite_is_wholesale() {
        let registry = ServiceRegistry::default();
        let id = TenantId::new();
        registry.put_backends(id, vec![Backend::new("a", 1), Backend::new("b", 2)]).await;
        registry.put_backends(id, vec![Backend::new("c", 3)]).await;
        assert_eq!(registry.backends(&id).await, vec![Backend::new("c", 3)]);
    }

    #[tokio::test]
    async fn test_invalidate_drops_names() {
        let registry = ServiceRegistry::default();
        let id = TenantId::new();
        let other = TenantId::new();
        registry.put_name("shop", id).await;
        registry.put_name("other", other).await;
        registry.put_backends(id, vec![Backend::new("a", 1)]).await;

        registry.invalidate(&id).await;
        assert!(registry.tenant_id_by_name("shop").await.is_none());
        assert_eq!(registry.tenant_id_by_name("other").await, Some(other));
        assert!(registry.backends(&id).await.is_empty());
    }
}
