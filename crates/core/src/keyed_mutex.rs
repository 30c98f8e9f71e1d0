//! Process-local reference-counted mutex registry.
//!
//! Callers competing for the same distributed lock key first serialize
//! through this registry, so at most one task per process goes on to poll
//! the remote store. Entries are created on first use and reclaimed by a
//! background sweeper once unreferenced and idle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Idle age after which an unreferenced entry is reclaimed.
const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(600);

/// Interval between sweeper passes.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
    last_used: Instant,
}

struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
    idle_after: Duration,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registry of per-key async mutexes.
///
/// Concurrent [`key`](KeyedMutex::key) calls with the same key observe the
/// same underlying mutex; different keys are independent. The registry is
/// cheap to clone and all clones share state.
///
/// Must be constructed inside a Tokio runtime: the constructor spawns the
/// sweeper task. The sweeper holds only a weak reference, so dropping the
/// last `KeyedMutex` clone retires it.
#[derive(Clone)]
pub struct KeyedMutex {
    registry: Arc<Registry>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::with_policy(DEFAULT_IDLE_AFTER, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a registry with a custom idle threshold and sweep cadence.
    pub fn with_policy(idle_after: Duration, sweep_interval: Duration) -> Self {
        let registry = Arc::new(Registry {
            entries: Mutex::new(HashMap::new()),
            idle_after,
        });
        tokio::spawn(sweep(Arc::downgrade(&registry), sweep_interval));
        Self { registry }
    }

    /// Handle to the mutex for `key`, creating the entry on first use.
    ///
    /// The entry's reference count is held until the returned handle is
    /// dropped; referenced entries are never reclaimed.
    pub fn key(&self, key: &str) -> KeyHandle {
        let mut entries = self.registry.entries();
        let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
            mutex: Arc::new(AsyncMutex::new(())),
            refs: 0,
            last_used: Instant::now(),
        });
        entry.refs += 1;
        entry.last_used = Instant::now();
        let mutex = Arc::clone(&entry.mutex);
        drop(entries);

        KeyHandle {
            registry: Arc::clone(&self.registry),
            key: key.to_owned(),
            mutex,
        }
    }

    /// Number of live entries, referenced or not.
    pub fn len(&self) -> usize {
        self.registry.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A counted reference to one key's mutex.
pub struct KeyHandle {
    registry: Arc<Registry>,
    key: String,
    mutex: Arc<AsyncMutex<()>>,
}

impl KeyHandle {
    /// Block until this key's mutex is free.
    pub async fn lock(&self) -> KeyGuard {
        KeyGuard {
            _inner: Arc::clone(&self.mutex).lock_owned().await,
        }
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        let mut entries = self.registry.entries();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.refs = entry.refs.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}

/// Exclusive hold on one key's mutex; released on drop.
pub struct KeyGuard {
    _inner: OwnedMutexGuard<()>,
}

async fn sweep(registry: Weak<Registry>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let mut entries = registry.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.refs > 0 || entry.last_used.elapsed() < registry.idle_after
        });
        let reclaimed = before - entries.len();
        if reclaimed > 0 {
            debug!(reclaimed, remaining = entries.len(), "swept idle key mutexes");
        }
    }
}
