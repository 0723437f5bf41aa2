//! Reference-counted sharing of layers.
//!
//! Tail and tracking layers are shared by every registration that needs
//! them. A [`RefRegistry`] maps a key to one shared value and counts its
//! holders; the value leaves the registry when the last holder releases it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

struct Entry<V> {
    value: Arc<V>,
    count: usize,
}

/// Result of [`RefRegistry::release`].
#[derive(Debug)]
pub enum Release<V> {
    /// Other holders remain.
    Remaining(usize),
    /// The last holder released; the value was removed and is handed back.
    Emptied(Arc<V>),
}

/// Shared values with holder counts.
pub struct RefRegistry<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> std::fmt::Debug for RefRegistry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefRegistry")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

impl<K, V> Default for RefRegistry<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> RefRegistry<K, V> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value under `key`, creating it with `create` if absent.
    ///
    /// A newly created value starts with zero holders; callers take a hold
    /// with [`acquire`](Self::acquire). The boolean is `true` when the value
    /// was created by this call.
    ///
    /// # Errors
    ///
    /// Returns the error of `create`; nothing is inserted in that case.
    pub fn find_or_try_insert_with<E>(
        &self,
        key: &K,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<(Arc<V>, bool), E> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            return Ok((Arc::clone(&entry.value), false));
        }
        let value = Arc::new(create()?);
        entries.insert(
            key.clone(),
            Entry {
                value: Arc::clone(&value),
                count: 0,
            },
        );
        Ok((value, true))
    }

    /// Take a hold on `key`; returns the new count, or `None` if absent.
    pub fn acquire(&self, key: &K) -> Option<usize> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.count += 1;
        Some(entry.count)
    }

    /// Drop a hold on `key`; returns `None` if absent.
    ///
    /// The entry is removed when no holders remain, including an entry that
    /// was created and never acquired.
    pub fn release(&self, key: &K) -> Option<Release<V>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.count = entry.count.saturating_sub(1);
        if entry.count > 0 {
            return Some(Release::Remaining(entry.count));
        }
        entries.remove(key).map(|e| Release::Emptied(e.value))
    }

    /// Whether the next [`release`](Self::release) of `key` removes it.
    #[must_use]
    pub fn is_last_hold(&self, key: &K) -> bool {
        self.entries.lock().get(key).is_some_and(|e| e.count <= 1)
    }

    /// Remove `key` regardless of its count.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// The value under `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().get(key).map(|e| Arc::clone(&e.value))
    }

    /// Holder count of `key`.
    #[must_use]
    pub fn count(&self, key: &K) -> Option<usize> {
        self.entries.lock().get(key).map(|e| e.count)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys currently present.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }
}
