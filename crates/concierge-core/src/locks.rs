//! Per-key async mutexes.
//!
//! Used to serialize work on one conversation or one document while
//! unrelated keys proceed in parallel. An entry lives only while some
//! caller holds or waits on its lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Holds one key's lock. Dropping it releases the lock and prunes idle entries.
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = Arc::clone(self.map().entry(key.to_string()).or_default());
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            owner: self,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.map();
        // Released while the map is held so no new waiter can clone the
        // entry between the release and the prune.
        self.guard.take();
        // Also drops entries left behind by waiters that were cancelled.
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }
}
