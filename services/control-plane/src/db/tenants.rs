//! Tenant record sources.
//!
//! [`PgTenantSource`] reads stores and themes from the platform database and
//! appends the global apps declared in configuration. [`StaticTenantSource`]
//! holds records in memory (tests, local development).

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;
use vitrine_namespace::{TenantId, TenantKind};
use vitrine_reconcile::{ErrorContext, Outcome};

use super::DbError;
use crate::config::GlobalApp;
use crate::tenant::TenantRecord;

/// A row that exists but could not be turned into a record.
#[derive(Debug)]
pub struct RejectedRow {
    pub kind: TenantKind,
    /// Absent when even the id column was unreadable.
    pub id: Option<TenantId>,
    pub error: DbError,
}

/// Result of listing tenants: the records that decoded, and the rows that
/// did not.
#[derive(Debug, Default)]
pub struct TenantListing {
    pub records: Vec<TenantRecord>,
    pub rejected: Vec<RejectedRow>,
}

impl TenantListing {
    pub fn new(records: Vec<TenantRecord>) -> Self {
        Self {
            records,
            rejected: Vec::new(),
        }
    }

    /// One `load_tenant` failure per rejected row of `kind` (every kind when
    /// `None`).
    pub fn outcome(&self, kind: Option<TenantKind>) -> Outcome {
        self.rejected
            .iter()
            .filter(|row| kind.map_or(true, |wanted| wanted == row.kind))
            .map(|row| {
                Outcome::failure(match row.id {
                    Some(id) => ErrorContext::tenant(id, "load_tenant", &row.error),
                    None => ErrorContext::platform("load_tenant", &row.error),
                })
            })
            .collect()
    }

    /// Base ids of every tenant that exists, including rejected rows.
    /// `None` when a rejected row has no readable id, so the set is unknown.
    pub fn known_base_ids(&self) -> Option<HashSet<String>> {
        let mut known: HashSet<String> = self.records.iter().map(TenantRecord::base_id).collect();
        for row in &self.rejected {
            known.insert(row.id?.base_id());
        }
        Some(known)
    }
}

/// Read access to tenant records.
#[async_trait]
pub trait TenantSource: Send + Sync {
    /// Every tenant record of every kind. A row that fails to decode is
    /// reported in [`TenantListing::rejected`] instead of failing the listing.
    async fn list_tenants(&self) -> Result<TenantListing, DbError>;

    /// One tenant record, if it exists.
    async fn find_tenant(
        &self,
        kind: TenantKind,
        id: &TenantId,
    ) -> Result<Option<TenantRecord>, DbError>;
}

const STORE_COLUMNS: &str = r#"
    s.id,
    s.name,
    COALESCE(s.domain_names, ARRAY[]::text[]) AS domain_names,
    s.is_active,
    s.current_theme_id,
    COALESCE(s.replicas, 1) AS replicas,
    s.image,
    COALESCE(s.environment, '{}'::jsonb) AS environment,
    to_jsonb(s) AS attributes
"#;

const THEME_COLUMNS: &str = r#"
    t.id,
    t.name,
    COALESCE(t.domain_names, ARRAY[]::text[]) AS domain_names,
    t.is_running AS is_active,
    NULL::uuid AS current_theme_id,
    COALESCE(t.replicas, 1) AS replicas,
    t.image,
    COALESCE(t.environment, '{}'::jsonb) AS environment,
    to_jsonb(t) AS attributes
"#;

/// Postgres-backed tenant source.
#[derive(Clone)]
pub struct PgTenantSource {
    pool: PgPool,
    global_apps: Vec<GlobalApp>,
}

impl PgTenantSource {
    pub fn new(pool: PgPool, global_apps: Vec<GlobalApp>) -> Self {
        Self { pool, global_apps }
    }

    /// Table, alias and column list for kinds stored in the database.
    /// Apps come from configuration.
    fn table(kind: TenantKind) -> Option<(&'static str, &'static str, &'static str)> {
        match kind {
            TenantKind::Store => Some(("stores", "s", STORE_COLUMNS)),
            TenantKind::Theme => Some(("themes", "t", THEME_COLUMNS)),
            TenantKind::App => None,
        }
    }

    async fn list_kind(&self, kind: TenantKind, listing: &mut TenantListing) -> Result<(), DbError> {
        let Some((table, alias, columns)) = Self::table(kind) else {
            return Ok(());
        };
        let sql = format!("SELECT {columns} FROM {table} {alias} ORDER BY {alias}.id");

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;

        for row in &rows {
            match decode_row(kind, table, row) {
                Ok(record) => listing.records.push(record),
                Err(error) => {
                    let id = row.try_get::<Uuid, _>("id").ok().map(TenantId::from_uuid);
                    warn!(table, id = ?id, error = %error, "Skipping undecodable tenant row");
                    listing.rejected.push(RejectedRow { kind, id, error });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TenantSource for PgTenantSource {
    async fn list_tenants(&self) -> Result<TenantListing, DbError> {
        let mut listing = TenantListing::new(self.global_apps.iter().map(TenantRecord::from).collect());
        self.list_kind(TenantKind::Theme, &mut listing).await?;
        self.list_kind(TenantKind::Store, &mut listing).await?;

        debug!(
            count = listing.records.len(),
            rejected = listing.rejected.len(),
            "Loaded tenant records"
        );
        Ok(listing)
    }

    async fn find_tenant(
        &self,
        kind: TenantKind,
        id: &TenantId,
    ) -> Result<Option<TenantRecord>, DbError> {
        let Some((table, alias, columns)) = Self::table(kind) else {
            return Ok(self
                .global_apps
                .iter()
                .find(|app| app.id == *id)
                .map(TenantRecord::from));
        };
        let sql = format!("SELECT {columns} FROM {table} {alias} WHERE {alias}.id = $1");

        let row = sqlx::query(&sql)
            .bind(id.uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;

        row.map(|row| decode_row(kind, table, &row)).transpose()
    }
}

fn decode_row(kind: TenantKind, table: &'static str, row: &PgRow) -> Result<TenantRecord, DbError> {
    let decode = |id: &str, e: sqlx::Error| DbError::Decode {
        table,
        id: id.to_string(),
        message: e.to_string(),
    };

    let id: Uuid = row.try_get("id").map_err(|e| decode("?", e))?;
    let id_str = id.to_string();

    let replicas: i32 = row.try_get("replicas").map_err(|e| decode(&id_str, e))?;
    let environment: serde_json::Value =
        row.try_get("environment").map_err(|e| decode(&id_str, e))?;

    Ok(TenantRecord {
        kind,
        id: TenantId::from_uuid(id),
        name: row.try_get("name").map_err(|e| decode(&id_str, e))?,
        domain_names: row.try_get("domain_names").map_err(|e| decode(&id_str, e))?,
        is_active: row.try_get("is_active").map_err(|e| decode(&id_str, e))?,
        current_theme_id: row
            .try_get::<Option<Uuid>, _>("current_theme_id")
            .map_err(|e| decode(&id_str, e))?
            .map(TenantId::from_uuid),
        replicas: u32::try_from(replicas).unwrap_or(1),
        image: row.try_get("image").map_err(|e| decode(&id_str, e))?,
        environment: flatten_env(&environment),
        attributes: row.try_get("attributes").map_err(|e| decode(&id_str, e))?,
    })
}

/// Flatten a JSON object into string environment values. Non-object input
/// yields an empty map.
fn flatten_env(value: &serde_json::Value) -> BTreeMap<String, String> {
    let Some(map) = value.as_object() else {
        return BTreeMap::new();
    };

    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// In-memory tenant source.
#[derive(Default)]
pub struct StaticTenantSource {
    records: RwLock<Vec<TenantRecord>>,
    broken: RwLock<Vec<(TenantKind, TenantId)>>,
}

impl StaticTenantSource {
    pub fn new(records: Vec<TenantRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            broken: RwLock::new(Vec::new()),
        }
    }

    /// List a row for `id` that fails to decode.
    pub async fn add_broken(&self, kind: TenantKind, id: TenantId) {
        self.broken.write().await.push((kind, id));
    }

    /// Insert or replace a record (matched on kind and id).
    pub async fn upsert(&self, record: TenantRecord) {
        let mut records = self.records.write().await;
        match records
            .iter_mut()
            .find(|r| r.kind == record.kind && r.id == record.id)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Remove a record.
    pub async fn remove(&self, kind: TenantKind, id: &TenantId) {
        self.records
            .write()
            .await
            .retain(|r| !(r.kind == kind && r.id == *id));
    }
}

#[async_trait]
impl TenantSource for StaticTenantSource {
    async fn list_tenants(&self) -> Result<TenantListing, DbError> {
        let mut listing = TenantListing::new(self.records.read().await.clone());
        listing.rejected = self
            .broken
            .read()
            .await
            .iter()
            .map(|&(kind, id)| RejectedRow {
                kind,
                id: Some(id),
                error: DbError::Decode {
                    table: match kind {
                        TenantKind::Theme => "themes",
                        _ => "stores",
                    },
                    id: id.to_string(),
                    message: "column \"is_active\" is NULL".to_string(),
                },
            })
            .collect();
        Ok(listing)
    }

    async fn find_tenant(
        &self,
        kind: TenantKind,
        id: &TenantId,
    ) -> Result<Option<TenantRecord>, DbError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.kind == kind && r.id == *id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_env() {
        let env = flatten_env(&serde_json::json!({
            "SHOP_CURRENCY": "EUR",
            "MAX_UPLOAD_MB": 25,
            "FEATURE_X": true,
            "UNSET": null,
        }));

        assert_eq!(env.get("SHOP_CURRENCY").map(String::as_str), Some("EUR"));
        assert_eq!(env.get("MAX_UPLOAD_MB").map(String::as_str), Some("25"));
        assert_eq!(env.get("FEATURE_X").map(String::as_str), Some("true"));
        assert!(!env.contains_key("UNSET"));
    }

    #[test]
    fn test_flatten_env_non_object() {
        assert!(flatten_env(&serde_json::json!(["a"])).is_empty());
    }

    #[tokio::test]
    async fn test_static_source_upsert_and_find() {
        let id = TenantId::new();
        let source = StaticTenantSource::default();
        source
            .upsert(TenantRecord::new(TenantKind::Store, id, "shop"))
            .await;
        source
            .upsert(TenantRecord::new(TenantKind::Store, id, "shop").with_active(false))
            .await;

        let all = source.list_tenants().await.unwrap().records;
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_active);

        assert!(source
            .find_tenant(TenantKind::Theme, &id)
            .await
            .unwrap()
            .is_none());

        source.remove(TenantKind::Store, &id).await;
        assert!(source.list_tenants().await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_rows_are_reported_and_known() {
        let good = TenantRecord::new(TenantKind::Store, TenantId::new(), "shop");
        let broken = TenantId::new();
        let source = StaticTenantSource::new(vec![good.clone()]);
        source.add_broken(TenantKind::Store, broken).await;

        let listing = source.list_tenants().await.unwrap();
        assert_eq!(listing.records.len(), 1);

        assert!(listing.outcome(Some(TenantKind::Theme)).is_ok());
        let outcome = listing.outcome(None);
        assert_eq!(outcome.error_count(), 1);
        assert_eq!(outcome.errors[0].operation, "load_tenant");
        assert_eq!(outcome.errors[0].tenant_id, Some(broken.to_string()));

        let known = listing.known_base_ids().unwrap();
        assert!(known.contains(&good.base_id()));
        assert!(known.contains(&broken.base_id()));
    }

    #[test]
    fn test_rejected_row_without_id_makes_tenant_set_unknown() {
        let mut listing = TenantListing::new(vec![]);
        listing.rejected.push(RejectedRow {
            kind: TenantKind::Theme,
            id: None,
            error: DbError::Decode {
                table: "themes",
                id: "?".into(),
                message: "bad id".into(),
            },
        });
        assert!(listing.known_base_ids().is_none());
        assert!(listing.outcome(None).errors[0].tenant_id.is_none());
    }
}
