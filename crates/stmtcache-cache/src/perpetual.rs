//! Unbounded base cache.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use stmtcache_core::{Cache, CacheKey, Cx, Result};

/// A plain `HashMap` store. Two perpetual caches are equal when their ids are.
pub struct PerpetualCache<V> {
    id: String,
    entries: Mutex<HashMap<CacheKey, V>>,
}

impl<V> PerpetualCache<V> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn insert(&self, key: CacheKey, value: V) {
        self.entries.lock().insert(key, value);
    }

    pub fn take(&self, key: &CacheKey) -> Option<V> {
        self.entries.lock().remove(key)
    }

    pub fn clear_entries(&self) {
        self.entries.lock().clear();
    }
}

impl<V: Clone> PerpetualCache<V> {
    /// Lookup without a context; the perpetual store never blocks.
    pub fn lookup(&self, key: &CacheKey) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }
}

impl<V> Cache<V> for PerpetualCache<V>
where
    V: Clone + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn put(&self, key: CacheKey, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }

    fn get(&self, _cx: &Cx, key: &CacheKey) -> Result<Option<V>> {
        Ok(self.lookup(key))
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<V>> {
        Ok(self.take(key))
    }

    fn clear(&self) -> Result<()> {
        self.clear_entries();
        Ok(())
    }
}

impl<V> PartialEq for PerpetualCache<V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<V> Eq for PerpetualCache<V> {}

impl<V> Hash for PerpetualCache<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<V> fmt::Debug for PerpetualCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerpetualCache")
            .field("id", &self.id)
            .field("size", &self.len())
            .finish()
    }
}
