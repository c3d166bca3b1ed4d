//! Hit-ratio reporting decorator.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use stmtcache_core::{Cache, CacheKey, Cx, Result};

/// Counts lookups and hits, logging the running hit ratio on every `get`.
pub struct LoggingCache<V, C> {
    delegate: C,
    requests: AtomicU64,
    hits: AtomicU64,
    _value: PhantomData<fn() -> V>,
}

impl<V, C> LoggingCache<V, C>
where
    C: Cache<V>,
{
    pub fn new(delegate: C) -> Self {
        Self {
            delegate,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            _value: PhantomData,
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Fraction of lookups that hit, `0.0` before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let requests = self.requests();
        if requests == 0 {
            return 0.0;
        }
        self.hits() as f64 / requests as f64
    }

    pub fn delegate(&self) -> &C {
        &self.delegate
    }
}

impl<V, C> Cache<V> for LoggingCache<V, C>
where
    C: Cache<V>,
    V: Send + Sync,
{
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    fn put(&self, key: CacheKey, value: V) -> Result<()> {
        self.delegate.put(key, value)
    }

    fn get(&self, cx: &Cx, key: &CacheKey) -> Result<Option<V>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let value = self.delegate.get(cx, key)?;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(
            cache = %self.delegate.id(),
            hit = value.is_some(),
            hit_ratio = self.hit_ratio(),
            "cache lookup"
        );
        Ok(value)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<V>> {
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.delegate.clear()
    }
}

impl<V, C> fmt::Debug for LoggingCache<V, C>
where
    C: Cache<V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingCache")
            .field("id", &self.delegate.id())
            .field("requests", &self.requests())
            .field("hits", &self.hits())
            .finish()
    }
}
