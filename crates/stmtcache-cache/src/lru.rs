//! Size-bounded decorator that evicts the least recently used key.

use lru::LruCache as KeyOrder;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use stmtcache_core::{Cache, CacheKey, Cx, Result};

/// Default number of keys kept before eviction starts.
pub const DEFAULT_LRU_SIZE: usize = 1024;

/// Tracks key recency and evicts the eldest key from the delegate on overflow.
pub struct LruCache<V, C> {
    delegate: C,
    order: Mutex<KeyOrder<CacheKey, ()>>,
    _value: PhantomData<fn() -> V>,
}

impl<V, C> LruCache<V, C>
where
    C: Cache<V>,
{
    pub fn new(delegate: C) -> Self {
        Self::with_size(delegate, DEFAULT_LRU_SIZE)
    }

    /// A size of zero is treated as one.
    pub fn with_size(delegate: C, size: usize) -> Self {
        Self {
            delegate,
            order: Mutex::new(KeyOrder::new(capacity(size))),
            _value: PhantomData,
        }
    }

    pub fn set_size(&self, size: usize) {
        self.order.lock().resize(capacity(size));
    }

    pub fn capacity(&self) -> usize {
        self.order.lock().cap().get()
    }

    pub fn delegate(&self) -> &C {
        &self.delegate
    }
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl<V, C> Cache<V> for LruCache<V, C>
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
        self.delegate.put(key.clone(), value)?;
        let evicted = self.order.lock().push(key.clone(), ());
        if let Some((eldest, ())) = evicted {
            if eldest != key {
                tracing::trace!(cache = %self.delegate.id(), key = %eldest, "evicting eldest key");
                self.delegate.remove(&eldest)?;
            }
        }
        Ok(())
    }

    fn get(&self, cx: &Cx, key: &CacheKey) -> Result<Option<V>> {
        // Touch first so a hit counts as a use.
        let _ = self.order.lock().get(key);
        self.delegate.get(cx, key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<V>> {
        let _ = self.order.lock().pop(key);
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.order.lock().clear();
        self.delegate.clear()
    }
}

impl<V, C> fmt::Debug for LruCache<V, C>
where
    C: Cache<V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("id", &self.delegate.id())
            .field("capacity", &self.capacity())
            .finish()
    }
}
