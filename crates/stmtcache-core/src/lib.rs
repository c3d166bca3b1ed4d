//! Core types and traits for stmtcache.
//!
//! This crate provides the foundations shared by the cache layers and the
//! executor:
//!
//! - `Cache` capability trait every cache layer implements
//! - `CacheKey` order-sensitive composite keys
//! - Statement descriptors (`MappedStatement`, `BoundSql`, `Params`, `RowBounds`)
//! - `ExecutionAdapter` trait for the I/O boundary
//! - `ResultMapper` / `NestedQuery` seam for materializing rows
//! - `Outcome` and `Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod adapter;
pub mod cache;
pub mod error;
pub mod key;
pub mod mapping;
pub mod object;
pub mod row;
pub mod statement;
pub mod value;

pub use adapter::ExecutionAdapter;
pub use cache::Cache;
pub use error::{
    CacheError, CacheErrorKind, ConfigError, ConnectionError, ConnectionErrorKind, Error,
    ExecutorError, ExecutorErrorKind, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind,
};
pub use key::CacheKey;
pub use mapping::{ColumnMapper, NestedQuery, ResultMapper};
pub use object::{
    BatchResult, BoxFuture, CollectingSink, Property, QueryResult, ResultObject, ResultSink,
    RowCursor, TargetType,
};
pub use row::{ColumnInfo, Row};
pub use statement::{
    BoundSql, MappedStatement, ParameterMapping, ParameterMode, Params, RowBounds,
    SqlCommandType, StatementType,
};
pub use value::Value;
