//! Tenant identifier and kind types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::IdError;

/// A tenant identifier (store, theme or app record id).
///
/// Tenant ids are UUIDs. Everything the platform derives from a tenant is
/// keyed on the [`base_id`](TenantId::base_id): the first hyphen-separated
/// segment of the canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Creates a new random tenant ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a tenant ID from its hyphenated UUID form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }

        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|e| IdError::InvalidUuid {
                value: trimmed.to_string(),
                message: e.to_string(),
            })
    }

    /// Returns the short, stable prefix used to derive resource names.
    #[must_use]
    pub fn base_id(&self) -> String {
        let hyphenated = self.0.hyphenated().to_string();
        match hyphenated.split_once('-') {
            Some((base, _)) => base.to_string(),
            None => hyphenated,
        }
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TenantId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for TenantId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// The kind of workload a tenant runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantKind {
    /// A merchant's store backend.
    Store,
    /// A storefront template renderer.
    Theme,
    /// A global platform application.
    App,
}

impl TenantKind {
    /// All kinds, in reconciliation order.
    pub const ALL: [TenantKind; 3] = [TenantKind::App, TenantKind::Theme, TenantKind::Store];

    /// Stable lowercase label.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TenantKind::Store => "store",
            TenantKind::Theme => "theme",
            TenantKind::App => "app",
        }
    }
}

impl fmt::Display for TenantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "store" | "stores" => Ok(TenantKind::Store),
            "theme" | "themes" => Ok(TenantKind::Theme),
            "app" | "apps" => Ok(TenantKind::App),
            other => Err(IdError::UnknownKind(other.to_string())),
        }
    }
}
