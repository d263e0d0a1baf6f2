//! Per-key async mutual exclusion.
//!
//! Every transition on a request or session runs while holding that
//! identifier's lock, so two accepts (or two completions) for the same
//! request are strictly ordered. Locks on different keys never contend.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily-populated map of one async mutex per key.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        mutex.lock_owned().await
    }

    /// Drop the mutex for `key` if nobody holds or waits on it.
    pub fn release(&self, key: &K) {
        self.locks.remove_if(key, |_, m| Arc::strong_count(m) == 1);
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has a live mutex.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
