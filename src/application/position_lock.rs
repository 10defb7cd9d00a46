use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::domain::models::PositionKey;

/// Per-position logical lock, spec §5: "all supervisor actions on that
/// position are serialized by a per-position logical lock". Implemented as
/// a registry of keyed async mutexes rather than a database row lock, since
/// actions on a position span multiple exchange calls and must not hold a
/// database transaction open across them.
#[derive(Default)]
pub struct PositionLockRegistry {
    locks: Mutex<HashMap<PositionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PositionLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, key: &PositionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("position lock registry poisoned");
        locks.entry(key.clone()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    /// Acquires the lock for `key`, holding it until the returned guard
    /// drops. Stale entries are never evicted explicitly; the registry grows
    /// with the number of distinct positions ever touched, which is bounded
    /// by subscriber count times symbol count, not by tick count.
    pub async fn lock(&self, key: &PositionKey) -> OwnedMutexGuard<()> {
        let mutex = self.get_or_create(key);
        mutex.lock_owned().await
    }
}
