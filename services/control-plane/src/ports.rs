//! Port lease allocator.
//!
//! Finds free host ports for new instances and holds them under a short
//! lease until the instance is confirmed healthy (from then on the service's
//! published port is the record of it) or the lease expires.
//!
//! - Probing binds a local listener; any bind error means "used".
//! - Candidates are probed in concurrent batches, settling the whole batch
//!   before inspecting results.
//! - A port under a live lease is never handed to a second caller: the
//!   check-and-insert in [`PortAllocator::try_lease`] happens under one lock.
//! - Expired leases are removed by a background sweeper that only runs while
//!   the table is non-empty.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info};

/// Port allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port from `start` up to 65535 is used or leased.
    #[error("no free port at or above {start}")]
    Exhausted { start: u16 },

    /// The port already has a live lease.
    #[error("port {0} is already leased")]
    Leased(u16),
}

/// A time-bounded port reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub expires_at: Instant,
}

/// Allocator settings.
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    /// Address probe listeners bind on.
    pub bind_addr: IpAddr,
    /// Ports probed concurrently per batch.
    pub batch_size: u16,
    /// Interval between sweeps of expired leases.
    pub sweep_interval: Duration,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            batch_size: 100,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

struct Inner {
    config: PortAllocatorConfig,
    leases: Mutex<HashMap<u16, Instant>>,
    sweeping: AtomicBool,
}

impl Inner {
    fn leases(&self) -> MutexGuard<'_, HashMap<u16, Instant>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep(leases: &mut HashMap<u16, Instant>) -> usize {
        let now = Instant::now();
        let before = leases.len();
        leases.retain(|_, expires_at| *expires_at > now);
        before - leases.len()
    }
}

/// Port lease allocator. Cheap to clone; clones share one lease table.
#[derive(Clone)]
pub struct PortAllocator {
    inner: Arc<Inner>,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                leases: Mutex::new(HashMap::new()),
                sweeping: AtomicBool::new(false),
            }),
        }
    }

    /// Probe whether `port` can be bound right now.
    pub async fn is_port_free(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }

        match TcpListener::bind((self.inner.config.bind_addr, port)).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                debug!(port, error = %e, "port probe failed, treating as used");
                false
            }
        }
    }

    /// Find the first free, unleased port at or above `start`.
    ///
    /// The port is not reserved; use [`reserve`](Self::reserve) when the
    /// caller is about to launch on it.
    pub async fn find_available_port(&self, start: u16) -> Result<u16, PortError> {
        self.find_port(start, &BTreeSet::new()).await
    }

    async fn find_port(&self, start: u16, taken: &BTreeSet<u16>) -> Result<u16, PortError> {
        let batch = u32::from(self.inner.config.batch_size.max(1));
        let mut window_start = u32::from(start);

        while window_start <= u32::from(u16::MAX) {
            let window_end = (window_start + batch).min(u32::from(u16::MAX) + 1);

            let candidates: Vec<u16> = {
                let leases = self.inner.leases();
                let now = Instant::now();
                (window_start..window_end)
                    .filter_map(|p| u16::try_from(p).ok())
                    .filter(|p| *p != 0 && !taken.contains(p))
                    .filter(|p| leases.get(p).map_or(true, |expires_at| *expires_at <= now))
                    .collect()
            };

            let probes = candidates.iter().map(|&port| async move {
                (port, self.is_port_free(port).await)
            });
            let results = join_all(probes).await;

            if let Some((port, _)) = results.into_iter().find(|(_, free)| *free) {
                return Ok(port);
            }

            debug!(window_start, window_end, "port window exhausted, advancing");
            window_start = window_end;
        }

        Err(PortError::Exhausted { start })
    }

    /// Find a free port at or above `start` and lease it atomically.
    pub async fn reserve(&self, start: u16, ttl: Duration) -> Result<u16, PortError> {
        self.reserve_avoiding(start, ttl, &BTreeSet::new()).await
    }

    /// Like [`reserve`](Self::reserve), skipping `taken`: ports already
    /// published by services that a local bind cannot see (stopped, or
    /// running on another node).
    pub async fn reserve_avoiding(
        &self,
        start: u16,
        ttl: Duration,
        taken: &BTreeSet<u16>,
    ) -> Result<u16, PortError> {
        let mut from = start;

        loop {
            let port = self
                .find_port(from, taken)
                .await
                .map_err(|_| PortError::Exhausted { start })?;

            match self.try_lease(port, ttl) {
                Ok(()) => {
                    info!(port, ttl_secs = ttl.as_secs(), "Reserved port");
                    return Ok(port);
                }
                Err(PortError::Leased(_)) => {
                    // Lost the race for this port to a concurrent caller.
                    from = port.checked_add(1).ok_or(PortError::Exhausted { start })?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lease `port` unless it already has a live lease.
    pub fn try_lease(&self, port: u16, ttl: Duration) -> Result<(), PortError> {
        {
            let mut leases = self.inner.leases();
            let now = Instant::now();
            if leases.get(&port).is_some_and(|expires_at| *expires_at > now) {
                return Err(PortError::Leased(port));
            }
            leases.insert(port, now + ttl);
        }

        self.ensure_sweeper();
        Ok(())
    }

    /// Lease `port`, extending any existing lease.
    pub fn lease(&self, port: u16, ttl: Duration) -> PortLease {
        let expires_at = Instant::now() + ttl;
        self.inner.leases().insert(port, expires_at);
        self.ensure_sweeper();
        PortLease { port, expires_at }
    }

    /// Drop a lease (the port is now tracked elsewhere, or launch failed).
    pub fn release(&self, port: u16) -> bool {
        self.inner.leases().remove(&port).is_some()
    }

    /// Returns true if `port` has a live lease.
    pub fn is_leased(&self, port: u16) -> bool {
        self.inner
            .leases()
            .get(&port)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }

    /// Snapshot of the lease table.
    pub fn leases(&self) -> Vec<PortLease> {
        let mut leases: Vec<PortLease> = self
            .inner
            .leases()
            .iter()
            .map(|(&port, &expires_at)| PortLease { port, expires_at })
            .collect();
        leases.sort_by_key(|l| l.port);
        leases
    }

    /// Remove expired leases now. Returns how many were removed.
    pub fn sweep_once(&self) -> usize {
        Inner::sweep(&mut self.inner.leases())
    }

    /// Returns true while the background sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeping.load(Ordering::Acquire)
    }

    fn ensure_sweeper(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if self
            .inner
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            debug!("Port lease sweeper started");
            loop {
                tokio::time::sleep(inner.config.sweep_interval).await;

                // The flag is cleared under the table lock so a concurrent
                // lease either sees the sweeper running or starts a new one.
                let mut leases = inner.leases();
                let removed = Inner::sweep(&mut leases);
                if removed > 0 {
                    debug!(removed, remaining = leases.len(), "Swept expired port leases");
                }
                if leases.is_empty() {
                    inner.sweeping.store(false, Ordering::Release);
                    debug!("Port lease sweeper idle");
                    break;
                }
            }
        });
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortAllocatorConfig::default())
    }
}
