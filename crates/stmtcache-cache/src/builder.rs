//! Ordered composition of cache layers.

use crate::{BlockingCache, LoggingCache, LruCache, PerpetualCache};
use std::time::Duration;
use stmtcache_core::Cache;

/// Builds a cache stack once, always in the same order:
/// base store, then LRU eviction, then hit logging, then blocking.
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    /// Identity of the resulting cache
    pub id: String,
    /// Maximum number of keys; `None` leaves the cache unbounded
    pub size: Option<usize>,
    /// Log hit ratios on every lookup
    pub logging: bool,
    /// Wrap in the stampede-safe blocking decorator
    pub blocking: bool,
    /// Bound on gate waits; `None` or zero waits forever
    pub lock_timeout: Option<Duration>,
}

impl CacheBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            size: None,
            logging: false,
            blocking: false,
            lock_timeout: None,
        }
    }

    /// Enable LRU eviction beyond `size` keys.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Enable/disable hit-ratio logging.
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Enable/disable the blocking decorator.
    pub fn blocking(mut self, enabled: bool) -> Self {
        self.blocking = enabled;
        self
    }

    /// Set the gate wait bound. Only meaningful with blocking enabled.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Compose the configured layers.
    pub fn build<V>(self) -> Box<dyn Cache<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut cache: Box<dyn Cache<V>> = Box::new(PerpetualCache::<V>::new(self.id.clone()));
        if let Some(size) = self.size {
            cache = Box::new(LruCache::with_size(cache, size));
        }
        if self.logging {
            cache = Box::new(LoggingCache::new(cache));
        }
        if self.blocking {
            let blocking = BlockingCache::new(cache);
            if let Some(timeout) = self.lock_timeout {
                blocking.set_timeout(timeout);
            }
            cache = Box::new(blocking);
        }
        tracing::debug!(
            cache = %self.id,
            size = ?self.size,
            logging = self.logging,
            blocking = self.blocking,
            "cache built"
        );
        cache
    }
}
