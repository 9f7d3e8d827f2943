use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use super::RequestKey;

type Lock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug)]
struct Entry {
    lock: Lock,
    /// Number of callers holding or waiting for `lock`.
    interest: usize,
}

type Entries<K> = Arc<Mutex<HashMap<K, Entry>>>;

/// Hands out one mutual-exclusion lock per key.
///
/// All callers acquiring the same key get the same underlying lock. A registry entry lives as
/// long as someone holds or waits for its lock, and is removed once the last of them is gone.
///
/// The locks are not reentrant: acquiring a key again while holding its guard deadlocks.
#[derive(Clone)]
pub struct LockRegistry<K = RequestKey> {
    entries: Entries<K>,
}

impl<K> Default for LockRegistry<K> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
        }
    }
}

impl<K: Eq + Hash> fmt::Debug for LockRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl<K: Clone + Eq + Hash> LockRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    ///
    /// The returned guard releases the lock when dropped. Dropping the future while it waits
    /// unregisters it as well.
    pub async fn acquire(&self, key: &K) -> KeyLockGuard<K> {
        let (lock, interest) = self.register(key);
        let guard = lock.lock_owned().await;
        KeyLockGuard {
            _guard: guard,
            _interest: interest,
        }
    }

    fn register(&self, key: &K) -> (Lock, Interest<K>) {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            lock: Default::default(),
            interest: 0,
        });
        entry.interest += 1;

        let interest = Interest {
            entries: Arc::clone(&self.entries),
            key: key.clone(),
        };
        (Arc::clone(&entry.lock), interest)
    }
}

impl<K: Eq + Hash> LockRegistry<K> {
    /// The number of keys currently held or waited for.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregisters one caller from an [`Entry`] when dropped.
struct Interest<K: Eq + Hash> {
    entries: Entries<K>,
    key: K,
}

impl<K: Eq + Hash> Drop for Interest<K> {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.interest -= 1;
            if entry.interest == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key, see [`LockRegistry::acquire`].
pub struct KeyLockGuard<K: Eq + Hash = RequestKey> {
    // NOTE: field order matters, the lock has to be released before the interest goes away.
    _guard: OwnedMutexGuard<()>,
    _interest: Interest<K>,
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for KeyLockGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self._interest.key)
            .finish()
    }
}
