use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per key. Entries exist only while someone holds or waits for
/// the lock.
pub struct KeyedLock<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        KeyedLock { locks: DashMap::new() }
    }
}

pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLock<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        KeyedLock::default()
    }

    pub async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyGuard { owner: self, key: key.clone(), guard: Some(guard) }
    }

    /// Locks every key in the given order. Callers pass keys sorted the same
    /// way so overlapping batches cannot deadlock.
    pub async fn lock_all(&self, keys: &[K]) -> Vec<KeyGuard<'_, K>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // map's reference is the only one left: nobody holds or waits
        self.owner.locks.remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn entries_are_removed_when_released() {
        let locks = KeyedLock::new();
        {
            let _a = locks.lock(&1).await;
            let _b = locks.lock(&2).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_is_serialised() {
        let locks = Arc::new(KeyedLock::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = locks.lock(&"k").await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _g = locks.lock(&"k").await;
                order.lock().push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        order.lock().push("first");
        drop(first);
        waiter.await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(locks.is_empty());
    }
}
