//! Keyed coalescing trigger.
//!
//! A [`Debouncer`] wraps an expensive, eventually-consistent action (a proxy
//! reload, for example) and guarantees per key:
//!
//! - an idle key runs the action immediately and opens a cool-down window;
//! - triggers arriving during the window are coalesced, only the latest
//!   arguments are kept, and exactly one trailing run fires when the window
//!   closes (opening a new window);
//! - when a window closes with nothing pending the key goes idle and no timer
//!   is left behind.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, warn};

type Action<K, A> = Arc<dyn Fn(K, A) -> BoxFuture<'static, ()> + Send + Sync>;

/// What a call to [`Debouncer::trigger`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The key was idle; the action was started right away.
    Immediate,
    /// The key was cooling down; the arguments replaced any pending ones.
    Coalesced,
}

struct Slot<A> {
    pending: Option<A>,
}

struct Inner<K, A> {
    cooldown: Duration,
    action: Action<K, A>,
    slots: Mutex<HashMap<K, Slot<A>>>,
    idle: Notify,
}

impl<K, A> Inner<K, A> {
    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<A>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keyed debounce primitive. Cheap to clone.
pub struct Debouncer<K, A> {
    inner: Arc<Inner<K, A>>,
}

impl<K, A> Clone for Debouncer<K, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, A> Debouncer<K, A>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    A: Send + 'static,
{
    /// Create a debouncer around `action` with the given cool-down window.
    pub fn new<F, Fut>(cooldown: Duration, action: F) -> Self
    where
        F: Fn(K, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: Action<K, A> = Arc::new(move |key, args| Box::pin(action(key, args)));
        Self {
            inner: Arc::new(Inner {
                cooldown,
                action,
                slots: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Cool-down window length.
    pub fn cooldown(&self) -> Duration {
        self.inner.cooldown
    }

    /// Request a run of the action for `key`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger(&self, key: K, args: A) -> Trigger {
        {
            let mut slots = self.inner.slots();
            if let Some(slot) = slots.get_mut(&key) {
                slot.pending = Some(args);
                debug!(key = ?key, "coalesced trigger into cool-down window");
                return Trigger::Coalesced;
            }
            slots.insert(key.clone(), Slot { pending: None });
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(drive(inner, key, args));
        Trigger::Immediate
    }

    /// Returns true if `key` is running or cooling down.
    pub fn is_active(&self, key: &K) -> bool {
        self.inner.slots().contains_key(key)
    }

    /// Number of keys currently running or cooling down.
    pub fn active_count(&self) -> usize {
        self.inner.slots().len()
    }

    /// Wait until no key is active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.slots().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn drive<K, A>(inner: Arc<Inner<K, A>>, key: K, first: A)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    A: Send + 'static,
{
    let mut args = first;

    loop {
        let window_closes = tokio::time::Instant::now() + inner.cooldown;

        // Run on a separate task so a panicking action cannot wedge the slot.
        let run = tokio::spawn((inner.action)(key.clone(), args));
        if let Err(e) = run.await {
            warn!(key = ?key, error = %e, "debounced action panicked");
        }

        tokio::time::sleep_until(window_closes).await;

        let next = {
            let mut slots = inner.slots();
            match slots.get_mut(&key).and_then(|slot| slot.pending.take()) {
                Some(pending) => Some(pending),
                None => {
                    slots.remove(&key);
                    None
                }
            }
        };

        match next {
            Some(pending) => {
                debug!(key = ?key, "running trailing call after cool-down");
                args = pending;
            }
            None => {
                inner.idle.notify_waiters();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(cooldown: Duration) -> (Debouncer<&'static str, u32>, Arc<Mutex<Vec<u32>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let debouncer = Debouncer::new(cooldown, move |_key, n| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(n);
            }
        });
        (debouncer, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_key_runs_immediately() {
        let (debouncer, calls) = recording(Duration::from_millis(500));

        assert_eq!(debouncer.trigger("proxy", 1), Trigger::Immediate);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(*calls.lock().unwrap(), vec![1]);
        assert!(debouncer.is_active(&"proxy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_one_trailing_call_with_last_args() {
        let (debouncer, calls) = recording(Duration::from_millis(500));

        debouncer.trigger("proxy", 0);
        tokio::time::sleep(Duration::from_millis(1)).await;

        for n in 1..=10 {
            assert_eq!(debouncer.trigger("proxy", n), Trigger::Coalesced);
        }

        // Nothing trailing before the window closes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*calls.lock().unwrap(), vec![0]);

        debouncer.wait_idle().await;
        assert_eq!(*calls.lock().unwrap(), vec![0, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_goes_idle_without_pending_calls() {
        let (debouncer, calls) = recording(Duration::from_millis(200));

        debouncer.trigger("proxy", 1);
        debouncer.wait_idle().await;

        assert_eq!(debouncer.active_count(), 0);
        assert_eq!(*calls.lock().unwrap(), vec![1]);

        // A later trigger starts a fresh immediate run.
        assert_eq!(debouncer.trigger("proxy", 2), Trigger::Immediate);
        debouncer.wait_idle().await;
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let debouncer = Debouncer::new(Duration::from_millis(300), move |key: &'static str, n: u32| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((key, n));
            }
        });

        assert_eq!(debouncer.trigger("a", 1), Trigger::Immediate);
        assert_eq!(debouncer.trigger("b", 1), Trigger::Immediate);
        assert_eq!(debouncer.trigger("a", 2), Trigger::Coalesced);
        debouncer.wait_idle().await;

        let mut seen = calls.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![("a", 1), ("a", 2), ("b", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_action_releases_slot() {
        let debouncer = Debouncer::new(Duration::from_millis(100), |_key: &'static str, _n: u32| async {
            panic!("boom");
        });

        debouncer.trigger("proxy", 1);
        debouncer.wait_idle().await;
        assert_eq!(debouncer.active_count(), 0);
    }
}
