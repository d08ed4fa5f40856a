//! Resource locks held for the duration of a build
//!
//! A build acquires its rendered lock keys before the first step and
//! releases them when its guard drops, whatever the build's outcome.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
#[error("timed out after {waited_secs} seconds waiting for lock '{key}'")]
pub struct LockTimeout {
    pub key: String,
    pub waited_secs: u64,
}

#[derive(Default)]
struct LockTable {
    held: Mutex<BTreeSet<String>>,
    released: Notify,
}

impl LockTable {
    fn try_take(&self, key: &str) -> bool {
        match self.held.lock() {
            Ok(mut held) => held.insert(key.to_string()),
            Err(_) => false,
        }
    }

    fn release(&self, keys: &[String]) {
        if let Ok(mut held) = self.held.lock() {
            for key in keys {
                held.remove(key);
            }
        }
        self.released.notify_waiters();
    }
}

/// Exclusive locks keyed by name, shared by every build of a master
#[derive(Clone, Default)]
pub struct LockManager {
    table: Arc<LockTable>,
}

/// Locks taken by one build; released on drop
pub struct LockGuard {
    table: Arc<LockTable>,
    keys: Vec<String>,
}

impl LockGuard {
    /// Keys this guard took (re-entrant keys are not included)
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.keys.is_empty() {
            debug!(locks = ?self.keys, "Releasing locks");
            self.table.release(&self.keys);
        }
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a key is currently held
    pub fn is_held(&self, key: &str) -> bool {
        self.table
            .held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }

    /// Acquire `keys` in sorted order
    ///
    /// Keys in `inherited` are already held by a waiting ancestor and are
    /// skipped. On timeout every key taken so far is released.
    pub async fn acquire(
        &self,
        keys: &[String],
        inherited: &BTreeSet<String>,
        wait: Duration,
    ) -> Result<LockGuard, LockTimeout> {
        let wanted: BTreeSet<&String> = keys.iter().filter(|k| !inherited.contains(*k)).collect();
        let mut guard = LockGuard {
            table: self.table.clone(),
            keys: Vec::new(),
        };

        let deadline = Instant::now() + wait;
        for key in wanted {
            loop {
                let released = self.table.released.notified();
                if self.table.try_take(key) {
                    guard.keys.push(key.clone());
                    break;
                }
                debug!(lock = %key, "Waiting for lock");
                if tokio::time::timeout_at(deadline, released).await.is_err() {
                    return Err(LockTimeout {
                        key: key.clone(),
                        waited_secs: wait.as_secs(),
                    });
                }
            }
        }

        Ok(guard)
    }
}
