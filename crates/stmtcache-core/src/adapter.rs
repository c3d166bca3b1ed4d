//! The execution adapter: the I/O boundary behind the executor.
//!
//! The executor never talks to a database itself. Every query, update,
//! batch, flush and transaction action is delegated to an
//! [`ExecutionAdapter`], which may fail at any call with a transport or
//! database error. All operations take a `Cx` for cancellation support.

use crate::error::Error;
use crate::object::{BatchResult, RowCursor};
use crate::row::Row;
use crate::statement::{BoundSql, MappedStatement, Params, RowBounds};
use asupersync::{Cx, Outcome};

/// Executes statements against the underlying transactional resource.
///
/// `params` is mutable because call-style statements write their output
/// parameters back onto it.
pub trait ExecutionAdapter: Send + Sync {
    /// Execute a write and return the number of affected rows.
    fn update(
        &self,
        cx: &Cx,
        statement: &MappedStatement,
        bound: &BoundSql,
        params: &mut Params,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute a read and return every row inside `bounds`.
    fn query(
        &self,
        cx: &Cx,
        statement: &MappedStatement,
        bound: &BoundSql,
        params: &mut Params,
        bounds: RowBounds,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a read and return a lazy cursor over its rows.
    fn query_cursor(
        &self,
        cx: &Cx,
        statement: &MappedStatement,
        bound: &BoundSql,
        params: &mut Params,
        bounds: RowBounds,
    ) -> impl Future<Output = Outcome<RowCursor, Error>> + Send;

    /// Queue a write for the next flush.
    fn batch(
        &self,
        cx: &Cx,
        statement: &MappedStatement,
        bound: &BoundSql,
        params: &mut Params,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Execute queued writes. On rollback the queue is discarded instead.
    fn flush_statements(
        &self,
        cx: &Cx,
        is_rollback: bool,
    ) -> impl Future<Output = Outcome<Vec<BatchResult>, Error>> + Send;

    /// Commit the underlying transactional resource.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the underlying transactional resource.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Release the underlying transactional resource.
    fn close(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
