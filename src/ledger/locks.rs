//! Keyed reader/writer locks
//!
//! One `RwLock` per key, created on demand. Idle locks are pruned once the
//! table grows past a threshold.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

const PRUNE_THRESHOLD: usize = 4096;

pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<RwLock<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `key`. Callers take `read_owned`/`write_owned` on it.
    pub async fn lock_for(&self, key: &K) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        if locks.len() >= PRUNE_THRESHOLD {
            // Only this table holds the Arc when nobody is using the lock.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
