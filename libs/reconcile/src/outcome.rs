//! Aggregated operation results.
//!
//! Pipeline stages report an [`Outcome`] instead of returning an error past
//! their boundary. Callers inspect [`Outcome::ok`] to decide whether to
//! continue; cleanup paths keep going and simply accumulate errors.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One failure, with enough context to act on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Tenant the failure belongs to (absent for platform-wide operations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Operation that failed (for example `provision.database`).
    pub operation: String,

    /// Underlying cause.
    pub cause: String,

    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

impl ErrorContext {
    /// Create a tenant-scoped error context.
    pub fn tenant(
        tenant_id: impl fmt::Display,
        operation: impl Into<String>,
        cause: impl fmt::Display,
    ) -> Self {
        Self {
            tenant_id: Some(tenant_id.to_string()),
            operation: operation.into(),
            cause: cause.to_string(),
            at: Utc::now(),
        }
    }

    /// Create a platform-wide error context.
    pub fn platform(operation: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            tenant_id: None,
            operation: operation.into(),
            cause: cause.to_string(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant_id {
            Some(tenant_id) => write!(f, "[{tenant_id}] {}: {}", self.operation, self.cause),
            None => write!(f, "{}: {}", self.operation, self.cause),
        }
    }
}

/// Aggregated pass/fail result with an ordered list of failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub ok: bool,
    pub errors: Vec<ErrorContext>,
}

impl Default for Outcome {
    fn default() -> Self {
        Self::success()
    }
}

impl Outcome {
    /// A successful outcome with no errors.
    pub fn success() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }

    /// A failed outcome carrying a single error.
    pub fn failure(error: ErrorContext) -> Self {
        Self {
            ok: false,
            errors: vec![error],
        }
    }

    /// Record a failure. The outcome is no longer ok.
    pub fn record(&mut self, error: ErrorContext) {
        self.ok = false;
        self.errors.push(error);
    }

    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: Outcome) {
        self.ok &= other.ok;
        self.errors.extend(other.errors);
    }

    /// Builder-style merge.
    #[must_use]
    pub fn and(mut self, other: Outcome) -> Self {
        self.merge(other);
        self
    }

    /// Returns true if the outcome is a success.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Number of recorded errors.
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

impl FromIterator<Outcome> for Outcome {
    fn from_iter<I: IntoIterator<Item = Outcome>>(iter: I) -> Self {
        iter.into_iter().fold(Outcome::success(), Outcome::and)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok {
            return f.write_str("ok");
        }

        write!(f, "failed ({} errors)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_flips_ok() {
        let mut outcome = Outcome::success();
        assert!(outcome.is_ok());

        outcome.record(ErrorContext::tenant("t1", "provision.user", "useradd exited 1"));
        assert!(!outcome.is_ok());
        assert_eq!(outcome.error_count(), 1);
        assert_eq!(outcome.errors[0].tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_merge_keeps_order() {
        let a = Outcome::failure(ErrorContext::platform("gc.volume", "permission denied"));
        let b = Outcome::failure(ErrorContext::tenant("t2", "launch", "timeout"));
        let merged: Outcome = vec![Outcome::success(), a, b].into_iter().collect();

        assert!(!merged.ok);
        assert_eq!(merged.errors[0].operation, "gc.volume");
        assert_eq!(merged.errors[1].operation, "launch");
    }

    #[test]
    fn test_all_success_stays_ok() {
        let merged: Outcome = (0..3).map(|_| Outcome::success()).collect();
        assert!(merged.ok);
        assert!(merged.errors.is_empty());
    }

    #[test]
    fn test_display() {
        let outcome = Outcome::failure(ErrorContext::tenant("t1", "probe", "no match"));
        assert_eq!(outcome.to_string(), "failed (1 errors); [t1] probe: no match");
    }
}
