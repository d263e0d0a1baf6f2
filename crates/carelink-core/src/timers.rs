//! Cancellable per-request offer timers.
//!
//! One timer per pending request. Arming replaces any earlier timer for the
//! same request; disarming aborts it. A fired timer removes its own entry
//! before running its action, so the action may freely disarm or re-arm.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use carelink_types::RequestId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::AbortHandle;

struct Armed {
    generation: u64,
    handle: AbortHandle,
}

/// Table of live offer timers. Clones share state.
#[derive(Clone, Default)]
pub struct ReofferTimers {
    armed: Arc<DashMap<RequestId, Armed>>,
    generation: Arc<AtomicU64>,
}

impl ReofferTimers {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` after `delay` unless disarmed first.
    pub fn arm<F>(&self, id: RequestId, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let armed = Arc::clone(&self.armed);
        // Hold the slot while spawning so a zero delay cannot fire before
        // the entry exists.
        let slot = self.armed.entry(id);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if armed
                .remove_if(&id, |_, a| a.generation == generation)
                .is_some()
            {
                tracing::debug!(request_id = %id, "Offer window elapsed");
                on_fire.await;
            }
        });
        let timer = Armed {
            generation,
            handle: task.abort_handle(),
        };
        match slot {
            Entry::Occupied(mut occupied) => occupied.insert(timer).handle.abort(),
            Entry::Vacant(vacant) => {
                vacant.insert(timer);
            }
        }
    }

    /// Abort the timer for `id`. Returns whether one was armed.
    pub fn disarm(&self, id: RequestId) -> bool {
        self.armed.remove(&id).is_some_and(|(_, a)| {
            a.handle.abort();
            true
        })
    }

    /// Whether a timer is armed for `id`.
    pub fn is_armed(&self, id: RequestId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn bump(fired: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let fired = Arc::clone(fired);
        async move {
            fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let timers = ReofferTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = RequestId::new();
        timers.arm(id, Duration::from_secs(3), bump(&fired));

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(id));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_suppresses_action() {
        let timers = ReofferTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = RequestId::new();
        timers.arm(id, Duration::from_secs(3), bump(&fired));
        assert!(timers.disarm(id));
        assert!(!timers.disarm(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let timers = ReofferTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = RequestId::new();
        timers.arm(id, Duration::from_secs(1), bump(&fired));
        timers.arm(id, Duration::from_secs(5), bump(&fired));
        assert_eq!(timers.armed_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
