//! Per-key asynchronous locks
//!
//! Each cache path gets its own FIFO mutex, so work on one key never waits
//! behind work on another. Entries are created on first use and, unless
//! eviction is disabled, removed again once nobody holds or waits for them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<PathBuf, Arc<AsyncMutex<()>>>;

/// Registry handing out one lock per resolved cache path
#[derive(Debug, Clone)]
pub struct KeyLockRegistry {
    locks: Arc<Mutex<LockMap>>,
    evict_idle: bool,
}

impl Default for KeyLockRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl KeyLockRegistry {
    pub fn new(evict_idle: bool) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            evict_idle,
        }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Waiters are granted the lock in the order they asked for it.
    pub async fn acquire(&self, key: &Path) -> KeyLockGuard {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.to_path_buf()).or_default())
        };

        let mut waiting = Waiting {
            registry: self,
            key,
            acquired: false,
        };
        let guard = lock.lock_owned().await;
        waiting.acquired = true;

        KeyLockGuard {
            key: key.to_path_buf(),
            guard: Some(guard),
            registry: self.clone(),
        }
    }

    /// Number of keys that currently have a lock allocated
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    fn release(&self, key: &Path, guard: OwnedMutexGuard<()>) {
        let mut locks = self.locks.lock();
        drop(guard);
        self.evict_if_idle(&mut locks, key);
    }

    fn evict_if_idle(&self, locks: &mut LockMap, key: &Path) {
        if !self.evict_idle {
            return;
        }

        // The map's own reference is the only one left: no holder, no waiter.
        // New waiters need the map lock to clone the Arc, so this can't race.
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}

/// Armed while `acquire` waits; a waiter dropped before it got the lock may
/// have been the last handle on an entry the holder already released.
struct Waiting<'a> {
    registry: &'a KeyLockRegistry,
    key: &'a Path,
    acquired: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if !self.acquired {
            let mut locks = self.registry.locks.lock();
            self.registry.evict_if_idle(&mut locks, self.key);
        }
    }
}

/// Exclusive access to one key, released on drop
#[derive(Debug)]
pub struct KeyLockGuard {
    key: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
    registry: KeyLockRegistry,
}

impl KeyLockGuard {
    pub fn key(&self) -> &Path {
        &self.key
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.registry.release(&self.key, guard);
        }
    }
}
