//! Per-pod async mutual exclusion.
//!
//! Provider operations on the same pod run one at a time while different pods
//! proceed in parallel. Entries hold only weak references and are removed
//! when the last guard for a key is dropped, so the map never grows beyond
//! the set of pods with an operation in flight.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = DashMap<K, Weak<Mutex<()>>>;

/// Guard for one key. Releases the lock and prunes the map entry on drop.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    key: K,
    locks: Arc<LockMap<K>>,
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only `self.lock` is left: nobody holds or waits on this key.
        if Arc::strong_count(&self.lock) == 1 {
            let ours = Arc::downgrade(&self.lock);
            self.locks
                .remove_if(&self.key, |_, weak| Weak::ptr_eq(weak, &ours));
        }
    }
}

/// Map of async locks keyed by `K`.
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: Arc<LockMap<K>>,
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let lock = self.lock_for(key);
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyedLockGuard {
            guard: Some(guard),
            lock,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with a live lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key is locked or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        let mut entry = self
            .locks
            .entry(key.clone())
            .or_insert_with(Weak::new);
        if let Some(existing) = entry.upgrade() {
            return existing;
        }
        let fresh = Arc::new(Mutex::new(()));
        *entry = Arc::downgrade(&fresh);
        fresh
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use marketlet_core::PodKey;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedAsyncLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let key = PodKey::new("default", "a");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedAsyncLock::new();
        let _a = locks.lock(&PodKey::new("default", "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&PodKey::new("default", "b")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entry_removed_after_release() {
        let locks = KeyedAsyncLock::new();
        let key = PodKey::new("default", "a");
        drop(locks.lock(&key).await);
        assert!(locks.is_empty());
    }
}
