//! The cache capability shared by every cache layer.
//!
//! Layers compose by wrapping: a decorator holds a delegate implementing
//! [`Cache`] and implements [`Cache`] itself, so a base store can be wrapped
//! by any number of decorators in a fixed order.

use crate::error::Result;
use crate::key::CacheKey;
use asupersync::Cx;
use std::sync::Arc;

/// Minimal key/value capability set implemented by every cache layer.
///
/// Operations are synchronous and never perform I/O. [`Cache::get`] takes
/// the caller's context so a layer that may block (the locking decorator)
/// can observe cancellation while it waits.
pub trait Cache<V>: Send + Sync {
    /// Identity of this cache.
    fn id(&self) -> &str;

    /// Number of entries currently stored.
    fn size(&self) -> usize;

    /// Store `value` under `key`.
    #[allow(clippy::result_large_err)]
    fn put(&self, key: CacheKey, value: V) -> Result<()>;

    /// Look up `key`. `Ok(None)` means absent.
    #[allow(clippy::result_large_err)]
    fn get(&self, cx: &Cx, key: &CacheKey) -> Result<Option<V>>;

    /// Remove `key`, returning the previous value when the layer reports one.
    #[allow(clippy::result_large_err)]
    fn remove(&self, key: &CacheKey) -> Result<Option<V>>;

    /// Remove every entry.
    #[allow(clippy::result_large_err)]
    fn clear(&self) -> Result<()>;
}

impl<V, C> Cache<V> for Box<C>
where
    C: Cache<V> + ?Sized,
{
    fn id(&self) -> &str {
        (**self).id()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn put(&self, key: CacheKey, value: V) -> Result<()> {
        (**self).put(key, value)
    }

    fn get(&self, cx: &Cx, key: &CacheKey) -> Result<Option<V>> {
        (**self).get(cx, key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<V>> {
        (**self).remove(key)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

impl<V, C> Cache<V> for Arc<C>
where
    C: Cache<V> + ?Sized,
{
    fn id(&self) -> &str {
        (**self).id()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn put(&self, key: CacheKey, value: V) -> Result<()> {
        (**self).put(key, value)
    }

    fn get(&self, cx: &Cx, key: &CacheKey) -> Result<Option<V>> {
        (**self).get(cx, key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<V>> {
        (**self).remove(key)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}
