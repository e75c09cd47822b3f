//! Per-key mutual exclusion.
//!
//! Series mutations are serialized per series head and topic creation per
//! normalized subject. Lock entries are dropped again once nobody holds or
//! waits on them.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::hash::Hash;
use std::sync::Arc;

pub struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Block until the lock for `key` is held.
    pub fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyedGuard {
            guard: Some(mutex.lock_arc()),
            key: key.clone(),
            locks: self,
        }
    }

    /// Number of keys currently held or contended.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    key: K,
    locks: &'a KeyedLocks<K>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references the mutex: nobody is waiting.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
