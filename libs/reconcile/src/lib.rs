//! Reconciliation primitives.
//!
//! Helpers for loops that converge live infrastructure to stored intent:
//!
//! - **Desired state**: what a tenant record says (active or not).
//! - **Actual state**: what the orchestrator reports (running or not).
//! - **Convergence**: the action that moves actual toward desired.
//!
//! # Invariants
//!
//! - Every action is idempotent
//! - Decisions are deterministic given the same inputs
//! - Stage results are aggregated into an [`Outcome`], never thrown past a
//!   stage boundary

mod debounce;
mod outcome;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub use debounce::{Debouncer, Trigger};
pub use outcome::{ErrorContext, Outcome};

/// Desired state of a tenant workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Action required to converge a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Desired running, not running: provision and launch.
    Launch,
    /// Desired stopped, still running: scale to zero.
    Stop,
    /// Desired running and running: refresh registry and routing only.
    Refresh,
    /// Desired stopped and not running.
    Nothing,
}

/// Decide how to converge one tenant.
pub fn plan_action(desired: DesiredState, running: bool) -> ReconcileAction {
    match (desired, running) {
        (DesiredState::Running, false) => ReconcileAction::Launch,
        (DesiredState::Running, true) => ReconcileAction::Refresh,
        (DesiredState::Stopped, true) => ReconcileAction::Stop,
        (DesiredState::Stopped, false) => ReconcileAction::Nothing,
    }
}

/// A content digest for deterministic comparison of generated artifacts.
///
/// Used to detect no-op regenerations of proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigDigest(String);

impl ConfigDigest {
    /// Digest of raw bytes.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Default retry limit per tenant.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(30 * 60);
