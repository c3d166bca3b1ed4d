//! Cache implementations and decorators for stmtcache.
//!
//! - [`PerpetualCache`]: unbounded base store
//! - [`LruCache`]: size-bounded eviction
//! - [`LoggingCache`]: hit-ratio reporting
//! - [`BlockingCache`]: per-key gates against cache stampedes
//! - [`CacheBuilder`]: composes the above in a fixed order

pub mod blocking;
pub mod builder;
pub mod logging;
pub mod lru;
pub mod perpetual;

pub use blocking::BlockingCache;
pub use builder::CacheBuilder;
pub use logging::LoggingCache;
pub use lru::{DEFAULT_LRU_SIZE, LruCache};
pub use perpetual::PerpetualCache;
