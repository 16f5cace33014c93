//! Keyed mutual exclusion.
//!
//! One async mutex per key, created on first use. Used for per-peer
//! delivery, per-(peer, resource type) reconciliation, and per-instance
//! registry/cursor mutation. Different keys never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Guard for a held key. The key is released on drop.
pub type KeyedGuard = OwnedMutexGuard<()>;

/// Thread-safe map of named locks.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Wait for and take the lock for `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        self.slot(key).await.lock_owned().await
    }

    /// Take the lock for `key` only if nobody holds it.
    pub async fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        self.slot(key).await.try_lock_owned().ok()
    }

    /// Drop map entries nobody is holding or waiting on. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        let removed = before - locks.len();
        if removed > 0 {
            debug!(removed, remaining = locks.len(), "Pruned idle keyed locks");
        }
        removed
    }

    /// Number of keys currently tracked.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

pub fn delivery_key(instance_id: &str) -> String {
    format!("delivery:{instance_id}")
}

pub fn sync_key(instance_id: &str, resource_type: &str) -> String {
    format!("sync:{instance_id}:{resource_type}")
}

pub fn instance_key(instance_id: &str) -> String {
    format!("instance:{instance_id}")
}

pub fn inbox_key(instance_id: &str, message_id: &str) -> String {
    format!("inbox:{instance_id}:{message_id}")
}
