//! Scope-bound statement executor for stmtcache.
//!
//! `stmtcache-executor` is the **read/write orchestration layer**. It owns a
//! local result cache per unit of work and delegates all I/O to an
//! [`ExecutionAdapter`](stmtcache_core::ExecutionAdapter).
//!
//! # Role In The Architecture
//!
//! - **Local cache**: memoizes query results per cache key, with an explicit
//!   in-flight state for keys whose query is still running.
//! - **Recursion tracking**: nested selects re-enter the executor; deferred
//!   loads and STATEMENT-scope clearing run once the outermost call returns.
//! - **Invalidation**: writes, commit and rollback clear the local cache.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut executor = Executor::new(adapter);
//! let users = executor.query(&cx, &statement, &mut params, RowBounds::default()).await?;
//! executor.commit(&cx, true).await?;
//! ```

pub mod config;
mod deferred;
pub mod executor;
mod local;
pub mod mapper;

pub use config::{ExecutorConfig, LocalCacheScope};
pub use executor::{Executor, ExecutorDebugInfo};
pub use local::LocalEntry;
pub use mapper::{NestedSelect, NestedSelectMapper};
