//! Result materialization seam.
//!
//! A [`ResultMapper`] turns the rows an adapter returns into
//! [`ResultObject`]s. Mappers that resolve associations through further
//! queries do so through the [`NestedQuery`] handle they are given, which
//! routes back into the outermost executor so nested calls share its local
//! cache, recursion depth and deferred-load queue.

use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::object::{BoxFuture, QueryResult, ResultObject, TargetType};
use crate::row::Row;
use crate::statement::{BoundSql, MappedStatement, Params, RowBounds};
use asupersync::{Cx, Outcome};
use std::fmt;

/// Handle to the outermost executor, injected into result mappers.
pub trait NestedQuery: Send {
    /// Run a nested query through the executor's cached query path.
    fn query<'a>(
        &'a mut self,
        cx: &'a Cx,
        statement: &'a MappedStatement,
        params: &'a mut Params,
        bounds: RowBounds,
    ) -> BoxFuture<'a, Outcome<QueryResult, Error>>;

    /// Build the cache key the executor would use for this query.
    #[allow(clippy::result_large_err)]
    fn create_cache_key(
        &self,
        statement: &MappedStatement,
        params: &Params,
        bounds: RowBounds,
        bound: &BoundSql,
    ) -> Result<CacheKey>;

    /// Is `key` in flight or present in the local cache?
    fn is_cached(&self, key: &CacheKey) -> bool;

    /// Assign `property` on `target` from the result cached under `key`,
    /// now if it is present or once the outermost call completes otherwise.
    #[allow(clippy::result_large_err)]
    fn defer_load(
        &mut self,
        target: &ResultObject,
        property: &str,
        key: CacheKey,
        target_type: TargetType,
    ) -> Result<()>;
}

/// Turns adapter rows into result objects.
pub trait ResultMapper: Send + Sync + fmt::Debug {
    fn map_rows<'a>(
        &'a self,
        nested: &'a mut dyn NestedQuery,
        cx: &'a Cx,
        rows: Vec<Row>,
    ) -> BoxFuture<'a, Outcome<Vec<ResultObject>, Error>>;
}

/// One object per row, one value property per column.
#[derive(Debug, Clone)]
pub struct ColumnMapper {
    type_name: String,
}

impl ColumnMapper {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Map rows without touching the executor.
    pub fn map_plain(&self, rows: &[Row]) -> Vec<ResultObject> {
        rows.iter()
            .map(|row| ResultObject::from_row(self.type_name.clone(), row))
            .collect()
    }
}

impl ResultMapper for ColumnMapper {
    fn map_rows<'a>(
        &'a self,
        _nested: &'a mut dyn NestedQuery,
        _cx: &'a Cx,
        rows: Vec<Row>,
    ) -> BoxFuture<'a, Outcome<Vec<ResultObject>, Error>> {
        Box::pin(async move { Outcome::Ok(self.map_plain(&rows)) })
    }
}
