//! Per-conversation mutual exclusion.
//!
//! Maps `engine:value` resume keys to locks so that two runs continuing the
//! same agent conversation are strictly serialized: the second never streams
//! until the first reaches a terminal state. Table entries are reclaimed
//! with an explicit strong-count sweep as soon as no run holds or awaits
//! them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use takopi_core::ResumeToken;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Registry of per-conversation locks.
#[derive(Default, Clone)]
pub struct SessionLockRegistry {
    table: LockTable,
}

impl SessionLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `token`, waiting until any holder releases it.
    pub async fn acquire(&self, token: &ResumeToken) -> SessionGuard {
        let key = token.lock_key();
        let lock = {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
            let mut table = self.table.lock().unwrap();
            Arc::clone(table.entry(key.clone()).or_default())
        };
        trace!(key = %key, "waiting for session lock");
        let guard = lock.lock_owned().await;
        debug!(key = %key, "session lock acquired");
        SessionGuard {
            key,
            table: Arc::clone(&self.table),
            guard: Some(guard),
        }
    }

    /// Number of live table entries (held, awaited, or not yet swept).
    pub fn len(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let table = self.table.lock().unwrap();
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one conversation. Releasing the guard unlocks the
/// session and sweeps the table entry if nobody else references it.
pub struct SessionGuard {
    key: String,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Release the mutex before sweeping so a waiter can proceed.
        self.guard.take();
        #[allow(clippy::unwrap_used)]
        let mut table = self.table.lock().unwrap();
        // Strong count 1 means only the table itself still references the
        // lock: no holder, no waiter.
        let reclaim = table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if reclaim {
            debug!(key = %self.key, "reclaiming session lock entry");
            table.remove(&self.key);
        }
    }
}
