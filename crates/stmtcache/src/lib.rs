//! stmtcache - stampede-safe caches and a scope-bound local result cache.
//!
//! stmtcache sits in front of a query-execution pipeline and provides:
//!
//! - A per-key locking cache decorator so concurrent callers never recompute
//!   the same missing entry
//! - Order-sensitive composite cache keys
//! - A scope-bound executor that memoizes results within a unit of work,
//!   detects recursive loads and resolves deferred associations
//! - An `ExecutionAdapter` trait for the actual I/O
//!
//! # Quick Start
//!
//! ```ignore
//! use stmtcache::prelude::*;
//!
//! async fn example(cx: &Cx, adapter: impl ExecutionAdapter) -> Outcome<(), Error> {
//!     let mut executor = Executor::new(adapter);
//!     let statement = MappedStatement::select("users.byId", "SELECT * FROM users WHERE id = ?")
//!         .parameter(ParameterMapping::new("id"));
//!     let mut params = Params::named().with("id", 1_i64);
//!
//!     // First call runs the query, the second is served from the local cache.
//!     let first = executor.query(cx, &statement, &mut params, RowBounds::default()).await;
//!     let again = executor.query(cx, &statement, &mut params, RowBounds::default()).await;
//!
//!     executor.commit(cx, true).await
//! }
//! ```
//!
//! Shared caches are composed with [`CacheBuilder`]:
//!
//! ```ignore
//! let users: Box<dyn Cache<QueryResult>> = CacheBuilder::new("users")
//!     .size(512)
//!     .blocking(true)
//!     .lock_timeout(Duration::from_secs(5))
//!     .build();
//! ```

// Re-export all public types from sub-crates
pub use stmtcache_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    BatchResult,
    BoundSql,
    BoxFuture,
    Cache,
    CacheError,
    CacheErrorKind,
    CacheKey,
    CollectingSink,
    ColumnInfo,
    ColumnMapper,
    ConfigError,
    ConnectionError,
    ConnectionErrorKind,
    Error,
    ExecutionAdapter,
    ExecutorError,
    ExecutorErrorKind,
    MappedStatement,
    NestedQuery,
    ParameterMapping,
    ParameterMode,
    Params,
    Property,
    QueryError,
    QueryErrorKind,
    QueryResult,
    Result,
    ResultMapper,
    ResultObject,
    ResultSink,
    Row,
    RowBounds,
    RowCursor,
    SqlCommandType,
    StatementType,
    TargetType,
    TransactionError,
    TransactionErrorKind,
    Value,
};

pub use stmtcache_cache::{
    BlockingCache, CacheBuilder, DEFAULT_LRU_SIZE, LoggingCache, LruCache, PerpetualCache,
};

pub use stmtcache_executor::{
    Executor, ExecutorConfig, ExecutorDebugInfo, LocalCacheScope, LocalEntry, NestedSelect,
    NestedSelectMapper,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // Caches
        BlockingCache,
        Cache,
        CacheBuilder,
        CacheKey,
        Cx,
        Error,
        // Execution
        ExecutionAdapter,
        Executor,
        ExecutorConfig,
        LocalCacheScope,
        MappedStatement,
        NestedSelect,
        NestedSelectMapper,
        Outcome,
        ParameterMapping,
        Params,
        PerpetualCache,
        QueryResult,
        Result,
        ResultObject,
        Row,
        RowBounds,
        TargetType,
        Value,
    };
}
