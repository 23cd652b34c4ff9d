//! Per-user serialization of membership changes.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per user id, created on first use and dropped once no
/// task holds or waits for it. Clones share the same table.
#[derive(Clone, Default)]
pub struct UserLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`'s memberships.
    pub async fn lock(&self, user_id: &str) -> UserGuard {
        let lock = self
            .inner
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        UserGuard {
            locks: self.inner.clone(),
            user_id: user_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Users with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct UserGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        // Release first so the table holds the only remaining reference
        // when nobody else is queued.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
