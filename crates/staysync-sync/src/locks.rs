//! Per-stay locks shared by every feed a reconciler processes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use staysync_core::ReservationKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-stay locks, created on first use and never evicted.
///
/// Holding the guard for a key serializes the resolve, decide and write
/// sequence for that stay across all concurrently reconciled feeds.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<ReservationKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &ReservationKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Locks several keys at once. Keys are taken in sorted order and each at
    /// most once, so two callers holding overlapping sets cannot deadlock.
    pub async fn lock_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a ReservationKey>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let keys: BTreeSet<&ReservationKey> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
