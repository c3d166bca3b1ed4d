//! The scope-bound statement executor.
//!
//! An [`Executor`] owns a local result cache for one logical unit of work and
//! is the only component that touches it. Reads go through [`Executor::query`],
//! which memoizes results per [`CacheKey`], marks keys as in flight while they
//! run, and queues [`defer_load`](NestedQuery::defer_load) assignments until
//! the outermost call completes. Writes clear the local cache. All I/O is
//! delegated to the [`ExecutionAdapter`].
//!
//! One executor serves one caller at a time. Nested queries issued by result
//! mappers re-enter the executor through the [`NestedQuery`] handle and are
//! tracked by a depth counter, not by locks. The depth level and the in-flight
//! marker of a running query are held by guards, so a query future that is
//! dropped mid-await or unwinds leaves neither behind.

use crate::config::{ExecutorConfig, LocalCacheScope};
use crate::deferred::DeferredLoad;
use crate::local::{LocalCache, LocalEntry};
use asupersync::{Cx, Outcome};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use stmtcache_core::{
    BatchResult, BoundSql, BoxFuture, CacheKey, Error, ExecutionAdapter, ExecutorError,
    ExecutorErrorKind, MappedStatement, NestedQuery, Params, QueryResult, Result, ResultObject,
    ResultSink, RowBounds, RowCursor, StatementType, TargetType,
};

const CLOSED_MESSAGE: &str = "Executor was closed.";

/// Key, rendered text and page of one read.
struct Lookup {
    bounds: RowBounds,
    key: CacheKey,
    bound: BoundSql,
}

/// One level of query nesting, left again on drop.
struct DepthGuard {
    depth: Arc<AtomicUsize>,
}

impl DepthGuard {
    fn enter(depth: &Arc<AtomicUsize>) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self {
            depth: Arc::clone(depth),
        }
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-flight marker for one key, discarded on drop.
struct InFlightGuard {
    local: Arc<LocalCache>,
    key: CacheKey,
}

impl InFlightGuard {
    fn mark(local: &Arc<LocalCache>, key: CacheKey) -> Self {
        local.mark_in_flight(key.clone());
        Self {
            local: Arc::clone(local),
            key,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.local.discard(&self.key);
    }
}

/// Scoped query orchestrator over an [`ExecutionAdapter`].
pub struct Executor<A> {
    adapter: A,
    config: ExecutorConfig,
    local: Arc<LocalCache>,
    deferred_loads: VecDeque<DeferredLoad>,
    query_stack: Arc<AtomicUsize>,
    closed: bool,
}

impl<A: ExecutionAdapter> Executor<A> {
    /// Create an executor with the default configuration.
    pub fn new(adapter: A) -> Self {
        Self::with_config(adapter, ExecutorConfig::default())
    }

    /// Create an executor with custom configuration.
    pub fn with_config(adapter: A, config: ExecutorConfig) -> Self {
        Self {
            adapter,
            config,
            local: Arc::new(LocalCache::new()),
            deferred_loads: VecDeque::new(),
            query_stack: Arc::new(AtomicUsize::new(0)),
            closed: false,
        }
    }

    /// Get the execution adapter. Fails once the executor is closed.
    #[allow(clippy::result_large_err)]
    pub fn adapter(&self) -> Result<&A> {
        if self.closed {
            return Err(Error::closed(CLOSED_MESSAGE));
        }
        Ok(&self.adapter)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Execute a write. Clears the local cache first.
    #[tracing::instrument(level = "debug", skip(self, cx, statement, params), fields(statement = %statement.id()))]
    pub async fn update(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
    ) -> Outcome<u64, Error> {
        if self.closed {
            return Outcome::Err(Error::closed(CLOSED_MESSAGE));
        }
        self.clear_local_cache();
        let bound = statement.bound_sql(params);
        self.adapter.update(cx, statement, &bound, params).await
    }

    /// Queue a write in the adapter's batch. Clears the local cache first.
    #[tracing::instrument(level = "debug", skip(self, cx, statement, params), fields(statement = %statement.id()))]
    pub async fn batch(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
    ) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::closed(CLOSED_MESSAGE));
        }
        self.clear_local_cache();
        let bound = statement.bound_sql(params);
        self.adapter.batch(cx, statement, &bound, params).await
    }

    /// Execute queued writes.
    pub async fn flush_statements(&mut self, cx: &Cx) -> Outcome<Vec<BatchResult>, Error> {
        self.flush(cx, false).await
    }

    /// Discard queued writes ahead of a rollback.
    pub async fn flush_statements_for_rollback(
        &mut self,
        cx: &Cx,
    ) -> Outcome<Vec<BatchResult>, Error> {
        self.flush(cx, true).await
    }

    async fn flush(&mut self, cx: &Cx, is_rollback: bool) -> Outcome<Vec<BatchResult>, Error> {
        if self.closed {
            return Outcome::Err(Error::closed(CLOSED_MESSAGE));
        }
        self.adapter.flush_statements(cx, is_rollback).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Run a read through the local cache.
    #[tracing::instrument(level = "debug", skip(self, cx, statement, params), fields(statement = %statement.id()))]
    pub async fn query(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
        bounds: RowBounds,
    ) -> Outcome<QueryResult, Error> {
        let bound = statement.bound_sql(params);
        let key = match self.create_cache_key(statement, params, bounds, &bound) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };
        self.run_query(cx, statement, params, Lookup { bounds, key, bound }, None)
            .await
    }

    /// Run a read with a key and rendered text the caller already built.
    pub async fn query_with_key(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
        bounds: RowBounds,
        key: CacheKey,
        bound: BoundSql,
    ) -> Outcome<QueryResult, Error> {
        self.run_query(cx, statement, params, Lookup { bounds, key, bound }, None)
            .await
    }

    /// Run a read, handing every object to `sink`.
    ///
    /// The local lookup is skipped, but the key is still marked in flight
    /// while the query runs and the complete result is stored afterwards, so
    /// nested selects issued while mapping see it.
    #[tracing::instrument(level = "debug", skip(self, cx, statement, params, sink), fields(statement = %statement.id()))]
    pub async fn query_with_sink(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
        bounds: RowBounds,
        sink: &mut dyn ResultSink,
    ) -> Outcome<(), Error> {
        let bound = statement.bound_sql(params);
        let key = match self.create_cache_key(statement, params, bounds, &bound) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };
        match self
            .run_query(cx, statement, params, Lookup { bounds, key, bound }, Some(sink))
            .await
        {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Stream rows through the adapter. Never cached.
    pub async fn query_cursor(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
        bounds: RowBounds,
    ) -> Outcome<RowCursor, Error> {
        if self.closed {
            return Outcome::Err(Error::closed(CLOSED_MESSAGE));
        }
        let bound = statement.bound_sql(params);
        self.adapter
            .query_cursor(cx, statement, &bound, params, bounds)
            .await
    }

    /// Build the local cache key for a read.
    ///
    /// Parts, in order: statement id, offset, limit, rendered text, the value
    /// of every non-output parameter, then the environment id if configured.
    #[allow(clippy::result_large_err)]
    pub fn create_cache_key(
        &self,
        statement: &MappedStatement,
        params: &Params,
        bounds: RowBounds,
        bound: &BoundSql,
    ) -> Result<CacheKey> {
        if self.closed {
            return Err(Error::closed(CLOSED_MESSAGE));
        }
        let mut key = CacheKey::new();
        key.update(statement.id());
        key.update(bounds.offset);
        key.update(bounds.limit);
        key.update(bound.sql.as_str());
        for mapping in &bound.parameter_mappings {
            if mapping.is_input() {
                key.update(bound.parameter_value(params, &mapping.property));
            }
        }
        if let Some(environment) = &self.config.environment_id {
            key.update(environment.as_str());
        }
        Ok(key)
    }

    /// Is `key` in flight or present in the local cache?
    pub fn is_cached(&self, key: &CacheKey) -> bool {
        self.local.lookup(key).is_some()
    }

    /// Drop every local entry and output-parameter snapshot.
    pub fn clear_local_cache(&mut self) {
        if !self.closed {
            self.local.clear();
        }
    }

    fn run_query<'a>(
        &'a mut self,
        cx: &'a Cx,
        statement: &'a MappedStatement,
        params: &'a mut Params,
        lookup: Lookup,
        sink: Option<&'a mut dyn ResultSink>,
    ) -> BoxFuture<'a, Outcome<QueryResult, Error>> {
        Box::pin(async move {
            if self.closed {
                return Outcome::Err(Error::closed(CLOSED_MESSAGE));
            }
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            if self.depth() == 0 {
                self.discard_abandoned_state();
                if statement.is_flush_cache_required() {
                    self.clear_local_cache();
                }
            }

            let depth = DepthGuard::enter(&self.query_stack);
            let mut outcome = match sink {
                Some(sink) => self.query_into_sink(cx, statement, params, &lookup, sink).await,
                None => match self.local.lookup(&lookup.key) {
                    Some(LocalEntry::Present(result)) => {
                        tracing::trace!(statement = %statement.id(), key = %lookup.key, "local cache hit");
                        self.restore_output_parameters(statement, &lookup, params);
                        Outcome::Ok(result)
                    }
                    Some(LocalEntry::InFlight) => Outcome::Err(Error::Executor(ExecutorError {
                        kind: ExecutorErrorKind::RecursiveQuery,
                        statement_id: Some(statement.id().to_string()),
                        message: format!(
                            "Statement re-entered key {} while it is still being loaded; use a deferred load",
                            lookup.key
                        ),
                    })),
                    None => {
                        self.query_from_database(cx, statement, params, &lookup)
                            .await
                    }
                },
            };
            drop(depth);

            if self.depth() == 0 {
                if matches!(outcome, Outcome::Ok(_)) {
                    if let Err(e) = self.drain_deferred_loads() {
                        outcome = Outcome::Err(e);
                    }
                } else if !self.deferred_loads.is_empty() {
                    tracing::debug!(
                        discarded = self.deferred_loads.len(),
                        "discarding deferred loads after failed query"
                    );
                    self.deferred_loads.clear();
                }
                if self.config.local_cache_scope == LocalCacheScope::Statement {
                    self.clear_local_cache();
                }
            }
            outcome
        })
    }

    async fn query_from_database(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
        lookup: &Lookup,
    ) -> Outcome<QueryResult, Error> {
        tracing::debug!(statement = %statement.id(), key = %lookup.key, "local cache miss");
        let marker = InFlightGuard::mark(&self.local, lookup.key.clone());
        let outcome = self.execute_and_map(cx, statement, params, lookup).await;
        drop(marker);

        let objects = match outcome {
            Outcome::Ok(objects) => objects,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result: QueryResult = Arc::new(objects);
        self.local.store(lookup.key.clone(), Arc::clone(&result));
        if statement.kind() == StatementType::Callable {
            self.local
                .store_output_parameters(lookup.key.clone(), params.clone());
        }
        Outcome::Ok(result)
    }

    async fn execute_and_map(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
        lookup: &Lookup,
    ) -> Outcome<Vec<ResultObject>, Error> {
        let rows = match self
            .adapter
            .query(cx, statement, &lookup.bound, params, lookup.bounds)
            .await
        {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mapper = Arc::clone(statement.mapper());
        mapper.map_rows(self, cx, rows).await
    }

    async fn query_into_sink(
        &mut self,
        cx: &Cx,
        statement: &MappedStatement,
        params: &mut Params,
        lookup: &Lookup,
        sink: &mut dyn ResultSink,
    ) -> Outcome<QueryResult, Error> {
        let result = match self.query_from_database(cx, statement, params, lookup).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        for object in result.iter() {
            sink.handle(object.clone());
            if sink.stopped() {
                break;
            }
        }
        Outcome::Ok(result)
    }

    fn depth(&self) -> usize {
        self.query_stack.load(Ordering::SeqCst)
    }

    /// Drop what a query abandoned before reaching depth zero left behind:
    /// its deferred loads and, in STATEMENT scope, its local entries.
    fn discard_abandoned_state(&mut self) {
        if !self.deferred_loads.is_empty() {
            tracing::debug!(
                discarded = self.deferred_loads.len(),
                "discarding deferred loads of an abandoned query"
            );
            self.deferred_loads.clear();
        }
        if self.config.local_cache_scope == LocalCacheScope::Statement {
            self.clear_local_cache();
        }
    }

    /// Copy captured output parameters of a call-style statement back onto
    /// the caller's parameters.
    fn restore_output_parameters(
        &self,
        statement: &MappedStatement,
        lookup: &Lookup,
        params: &mut Params,
    ) {
        if statement.kind() != StatementType::Callable {
            return;
        }
        let Some(cached) = self.local.output_parameters(&lookup.key) else {
            return;
        };
        for mapping in &lookup.bound.parameter_mappings {
            if !mapping.is_output() {
                continue;
            }
            if let Some(value) = cached.get(&mapping.property) {
                params.set(mapping.property.clone(), value.clone());
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn drain_deferred_loads(&mut self) -> Result<()> {
        if self.deferred_loads.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = self.deferred_loads.len(), "draining deferred loads");

        let pending = std::mem::take(&mut self.deferred_loads);
        for load in pending {
            match self.local.lookup(load.key()) {
                Some(LocalEntry::Present(_)) => {
                    load.load(&self.local)?;
                }
                Some(LocalEntry::InFlight) => {
                    tracing::warn!(
                        key = %load.key(),
                        property = load.property(),
                        "deferred load source still in flight; deferring again"
                    );
                    self.deferred_loads.push_back(load);
                }
                None => {
                    self.deferred_loads.clear();
                    return Err(Error::Executor(ExecutorError {
                        kind: ExecutorErrorKind::DeferredLoad,
                        statement_id: None,
                        message: format!(
                            "Deferred load of property '{}' found no cached result for key {}",
                            load.property(),
                            load.key()
                        ),
                    }));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Scope lifecycle
    // ========================================================================

    /// Clear the local cache, flush queued writes, then commit if `required`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx, required: bool) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::closed(
                "Cannot commit, transaction is already closed",
            ));
        }
        self.clear_local_cache();
        match self.flush_statements(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if required {
            return self.adapter.commit(cx).await;
        }
        Outcome::Ok(())
    }

    /// Clear the local cache and discard queued writes; the resource rollback
    /// (when `required`) is attempted even if the flush fails.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx, required: bool) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Ok(());
        }
        self.clear_local_cache();
        let flushed = self.flush_statements_for_rollback(cx).await;
        let rolled_back = if required {
            self.adapter.rollback(cx).await
        } else {
            Outcome::Ok(())
        };

        match flushed {
            Outcome::Ok(_) => rolled_back,
            primary => {
                if let Outcome::Err(secondary) = &rolled_back {
                    tracing::warn!(error = %secondary, "rollback failed after flush failure");
                }
                match primary {
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                    Outcome::Ok(_) => Outcome::Ok(()),
                }
            }
        }
    }

    /// Best-effort rollback, release the resource, and enter the closed state.
    ///
    /// Failures are logged, never returned; closing twice is a no-op.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx, force_rollback: bool) {
        if self.closed {
            return;
        }
        match self.rollback(cx, force_rollback).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "unexpected exception on closing transaction"),
            Outcome::Cancelled(r) => tracing::warn!(reason = ?r, "rollback cancelled while closing"),
            Outcome::Panicked(p) => tracing::warn!(panic = ?p, "rollback panicked while closing"),
        }
        match self.adapter.close(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "unexpected exception on closing transaction"),
            Outcome::Cancelled(r) => tracing::warn!(reason = ?r, "close cancelled"),
            Outcome::Panicked(p) => tracing::warn!(panic = ?p, "close panicked"),
        }
        self.local.clear();
        self.deferred_loads.clear();
        self.closed = true;
    }

    // ========================================================================
    // Debug
    // ========================================================================

    /// Snapshot of the executor's internal counters.
    pub fn debug_state(&self) -> ExecutorDebugInfo {
        ExecutorDebugInfo {
            query_depth: self.depth(),
            deferred_loads: self.deferred_loads.len(),
            local_entries: self.local.len(),
            output_parameter_entries: self.local.output_parameter_len(),
            closed: self.closed,
        }
    }
}

impl<A: ExecutionAdapter> NestedQuery for Executor<A> {
    fn query<'a>(
        &'a mut self,
        cx: &'a Cx,
        statement: &'a MappedStatement,
        params: &'a mut Params,
        bounds: RowBounds,
    ) -> BoxFuture<'a, Outcome<QueryResult, Error>> {
        let bound = statement.bound_sql(params);
        match self.create_cache_key(statement, params, bounds, &bound) {
            Ok(key) => self.run_query(cx, statement, params, Lookup { bounds, key, bound }, None),
            Err(e) => Box::pin(async move { Outcome::Err(e) }),
        }
    }

    fn create_cache_key(
        &self,
        statement: &MappedStatement,
        params: &Params,
        bounds: RowBounds,
        bound: &BoundSql,
    ) -> Result<CacheKey> {
        Executor::create_cache_key(self, statement, params, bounds, bound)
    }

    fn is_cached(&self, key: &CacheKey) -> bool {
        Executor::is_cached(self, key)
    }

    fn defer_load(
        &mut self,
        target: &ResultObject,
        property: &str,
        key: CacheKey,
        target_type: TargetType,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::closed(CLOSED_MESSAGE));
        }
        let load = DeferredLoad::new(target, property, key, target_type);
        if load.can_load(&self.local) {
            load.load(&self.local)?;
        } else {
            tracing::trace!(key = %load.key(), property, "deferring load");
            self.deferred_loads.push_back(load);
        }
        Ok(())
    }
}

/// Debug information about executor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorDebugInfo {
    /// Current re-entrancy depth.
    pub query_depth: usize,
    /// Deferred loads waiting for the outermost call to complete.
    pub deferred_loads: usize,
    /// Entries in the local result store (in flight or present).
    pub local_entries: usize,
    /// Output-parameter snapshots of call-style statements.
    pub output_parameter_entries: usize,
    /// Whether the executor is closed.
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{NestedSelect, NestedSelectMapper};
    use asupersync::runtime::RuntimeBuilder;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::task::{Context, Poll, Waker};
    use stmtcache_core::{
        CollectingSink, ConnectionError, ConnectionErrorKind, ParameterMapping, ParameterMode,
        Property, ResultMapper, Row, TransactionError, TransactionErrorKind, Value,
    };

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    /// Poll a future exactly once, then drop it.
    fn poll_once<F: Future>(future: F) -> Poll<F::Output> {
        let mut future = std::pin::pin!(future);
        let mut task_cx = Context::from_waker(Waker::noop());
        future.as_mut().poll(&mut task_cx)
    }

    fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected error, got: {other:?}")),
        }
    }

    #[derive(Debug, Default)]
    struct MockState {
        tables: HashMap<String, Vec<Row>>,
        query_calls: usize,
        cursor_calls: usize,
        update_calls: usize,
        batch_calls: usize,
        flushes: Vec<bool>,
        commit_calls: usize,
        rollback_calls: usize,
        close_calls: usize,
        hang_on: Option<String>,
        fail_queries: bool,
        fail_flush: bool,
        fail_rollback: bool,
        fail_close: bool,
    }

    #[derive(Clone, Debug, Default)]
    struct MockAdapter {
        state: Arc<Mutex<MockState>>,
    }

    impl MockAdapter {
        fn with_rows(statement_id: &str, rows: Vec<Row>) -> Self {
            let adapter = Self::default();
            adapter.add_rows(statement_id, rows);
            adapter
        }

        fn add_rows(&self, statement_id: &str, rows: Vec<Row>) {
            self.state
                .lock()
                .tables
                .insert(statement_id.to_string(), rows);
        }

        fn query_calls(&self) -> usize {
            self.state.lock().query_calls
        }

        fn rows_for(&self, statement: &MappedStatement, bound: &BoundSql, params: &Params) -> Vec<Row> {
            let state = self.state.lock();
            let rows = state.tables.get(statement.id()).cloned().unwrap_or_default();
            rows.into_iter()
                .filter(|row| {
                    bound.parameter_mappings.iter().filter(|m| m.is_input()).all(|m| {
                        match row.get_by_name(&m.property) {
                            Some(value) => *value == bound.parameter_value(params, &m.property),
                            None => true,
                        }
                    })
                })
                .collect()
        }
    }

    fn adapter_failure() -> Error {
        Error::Query(stmtcache_core::QueryError {
            kind: stmtcache_core::QueryErrorKind::Database,
            sql: None,
            sqlstate: None,
            message: "connection reset".to_string(),
            source: None,
        })
    }

    impl ExecutionAdapter for MockAdapter {
        fn update(
            &self,
            _cx: &Cx,
            _statement: &MappedStatement,
            _bound: &BoundSql,
            _params: &mut Params,
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            self.state.lock().update_calls += 1;
            async { Outcome::Ok(1) }
        }

        fn query(
            &self,
            _cx: &Cx,
            statement: &MappedStatement,
            bound: &BoundSql,
            params: &mut Params,
            _bounds: RowBounds,
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            let calls = {
                let mut state = self.state.lock();
                state.query_calls += 1;
                state.query_calls
            };
            let (fail, hang) = {
                let state = self.state.lock();
                (
                    state.fail_queries,
                    state.hang_on.as_deref() == Some(statement.id()),
                )
            };
            let rows = self.rows_for(statement, bound, params);
            if statement.kind() == StatementType::Callable {
                for mapping in bound.parameter_mappings.iter().filter(|m| m.is_output()) {
                    params.set(mapping.property.clone(), Value::BigInt(calls as i64 * 100));
                }
            }
            async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                if fail {
                    Outcome::Err(adapter_failure())
                } else {
                    Outcome::Ok(rows)
                }
            }
        }

        fn query_cursor(
            &self,
            _cx: &Cx,
            statement: &MappedStatement,
            bound: &BoundSql,
            params: &mut Params,
            _bounds: RowBounds,
        ) -> impl Future<Output = Outcome<RowCursor, Error>> + Send {
            self.state.lock().cursor_calls += 1;
            let rows = self.rows_for(statement, bound, params);
            async move { Outcome::Ok(RowCursor::from_rows(rows)) }
        }

        fn batch(
            &self,
            _cx: &Cx,
            _statement: &MappedStatement,
            _bound: &BoundSql,
            _params: &mut Params,
        ) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().batch_calls += 1;
            async { Outcome::Ok(()) }
        }

        fn flush_statements(
            &self,
            _cx: &Cx,
            is_rollback: bool,
        ) -> impl Future<Output = Outcome<Vec<BatchResult>, Error>> + Send {
            let fail = {
                let mut state = self.state.lock();
                state.flushes.push(is_rollback);
                state.fail_flush
            };
            async move {
                if fail {
                    Outcome::Err(adapter_failure())
                } else {
                    Outcome::Ok(Vec::new())
                }
            }
        }

        fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().commit_calls += 1;
            async { Outcome::Ok(()) }
        }

        fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            let fail = {
                let mut state = self.state.lock();
                state.rollback_calls += 1;
                state.fail_rollback
            };
            async move {
                if fail {
                    Outcome::Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::Rollback,
                        message: "rollback failed".to_string(),
                    }))
                } else {
                    Outcome::Ok(())
                }
            }
        }

        fn close(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            let fail = {
                let mut state = self.state.lock();
                state.close_calls += 1;
                state.fail_close
            };
            async move {
                if fail {
                    Outcome::Err(Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Disconnected,
                        message: "connection already gone".to_string(),
                        source: None,
                    }))
                } else {
                    Outcome::Ok(())
                }
            }
        }
    }

    fn user_row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::BigInt(id), Value::from(name)],
        )
    }

    fn users_by_id() -> MappedStatement {
        MappedStatement::select("users.byId", "SELECT * FROM users WHERE id = ?")
            .parameter(ParameterMapping::new("id"))
    }

    fn users_adapter() -> MockAdapter {
        MockAdapter::with_rows("users.byId", vec![user_row(1, "Alice"), user_row(2, "Bob")])
    }

    fn run<F: Future>(future: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(future)
    }

    #[test]
    fn test_repeated_query_served_from_local_cache() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();

        run(async {
            let mut params = Params::named().with("id", 1i64);
            let first = unwrap_outcome(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            );
            let second = unwrap_outcome(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            );
            assert_eq!(first.len(), 1);
            assert_eq!(first[0].value("name"), Some(Value::from("Alice")));
            assert!(Arc::ptr_eq(&first, &second));
        });

        assert_eq!(adapter.query_calls(), 1);
        let debug = executor.debug_state();
        assert_eq!(debug.query_depth, 0);
        assert_eq!(debug.local_entries, 1);
    }

    #[test]
    fn test_distinct_parameters_are_distinct_entries() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();

        run(async {
            for id in [1i64, 2, 1, 2] {
                let mut params = Params::named().with("id", id);
                unwrap_outcome(
                    executor
                        .query(&cx, &statement, &mut params, RowBounds::default())
                        .await,
                );
            }
        });
        assert_eq!(adapter.query_calls(), 2);
    }

    #[test]
    fn test_statement_scope_clears_after_each_call() {
        let adapter = users_adapter();
        let config = ExecutorConfig::new().local_cache_scope(LocalCacheScope::Statement);
        let mut executor = Executor::with_config(adapter.clone(), config);
        let cx = Cx::for_testing();
        let statement = users_by_id();

        run(async {
            let mut params = Params::named().with("id", 1i64);
            for _ in 0..2 {
                unwrap_outcome(
                    executor
                        .query(&cx, &statement, &mut params, RowBounds::default())
                        .await,
                );
            }
        });
        assert_eq!(adapter.query_calls(), 2);
        assert_eq!(executor.debug_state().local_entries, 0);
    }

    #[test]
    fn test_empty_result_is_cached() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();

        run(async {
            let mut params = Params::named().with("id", 99i64);
            for _ in 0..2 {
                let result = unwrap_outcome(
                    executor
                        .query(&cx, &statement, &mut params, RowBounds::default())
                        .await,
                );
                assert!(result.is_empty());
            }
        });
        assert_eq!(adapter.query_calls(), 1);
    }

    #[test]
    fn test_update_invalidates_local_cache() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let select = users_by_id();
        let rename = MappedStatement::update("users.rename", "UPDATE users SET name = ? WHERE id = ?");

        run(async {
            let mut params = Params::named().with("id", 1i64);
            unwrap_outcome(executor.query(&cx, &select, &mut params, RowBounds::default()).await);
            let mut write = Params::named().with("id", 1i64).with("name", "Alicia");
            assert_eq!(unwrap_outcome(executor.update(&cx, &rename, &mut write).await), 1);
            assert_eq!(executor.debug_state().local_entries, 0);
            unwrap_outcome(executor.query(&cx, &select, &mut params, RowBounds::default()).await);
        });
        assert_eq!(adapter.query_calls(), 2);
        assert_eq!(adapter.state.lock().update_calls, 1);
    }

    #[test]
    fn test_flush_cache_select_clears_before_running() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let select = users_by_id();
        let fresh = users_by_id().flush_cache(true);

        run(async {
            let mut params = Params::named().with("id", 1i64);
            unwrap_outcome(executor.query(&cx, &select, &mut params, RowBounds::default()).await);
            unwrap_outcome(executor.query(&cx, &fresh, &mut params, RowBounds::default()).await);
        });
        assert_eq!(adapter.query_calls(), 2);
    }

    #[test]
    fn test_failure_leaves_no_in_flight_marker() {
        let adapter = users_adapter();
        adapter.state.lock().fail_queries = true;
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();
        let mut params = Params::named().with("id", 1i64);
        let bound = statement.bound_sql(&params);
        let key = executor
            .create_cache_key(&statement, &params, RowBounds::default(), &bound)
            .unwrap();

        run(async {
            let err = expect_err(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            );
            assert!(matches!(err, Error::Query(_)));
        });
        assert!(!executor.is_cached(&key));
        assert_eq!(executor.debug_state().query_depth, 0);

        adapter.state.lock().fail_queries = false;
        run(async {
            let result = unwrap_outcome(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            );
            assert_eq!(result.len(), 1);
        });
        assert!(executor.is_cached(&key));
    }

    #[test]
    fn test_cache_key_parts() {
        let executor = Executor::new(MockAdapter::default());
        let statement = MappedStatement::select("proc.total", "{call total(?, ?)}")
            .statement_type(StatementType::Callable)
            .parameter(ParameterMapping::new("id"))
            .parameter(ParameterMapping::new("total").mode(ParameterMode::Out));
        let params = Params::named().with("id", 3i64).with("total", 500i64);
        let bound = statement.bound_sql(&params);
        let bounds = RowBounds::new(10, 20);

        let key = executor
            .create_cache_key(&statement, &params, bounds, &bound)
            .unwrap();
        let expected = CacheKey::from_parts::<_, Value>([
            "proc.total".into(),
            10usize.into(),
            20usize.into(),
            "{call total(?, ?)}".into(),
            3i64.into(),
        ]);
        assert_eq!(key, expected);

        // Output parameters never contribute.
        let other = Params::named().with("id", 3i64).with("total", 7i64);
        assert_eq!(
            executor
                .create_cache_key(&statement, &other, bounds, &bound)
                .unwrap(),
            key
        );
    }

    #[test]
    fn test_environment_id_is_appended() {
        let statement = users_by_id();
        let params = Params::named().with("id", 1i64);
        let bound = statement.bound_sql(&params);

        let plain = Executor::new(MockAdapter::default());
        let prod = Executor::with_config(
            MockAdapter::default(),
            ExecutorConfig::new().environment_id("prod"),
        );
        let plain_key = plain
            .create_cache_key(&statement, &params, RowBounds::default(), &bound)
            .unwrap();
        let prod_key = prod
            .create_cache_key(&statement, &params, RowBounds::default(), &bound)
            .unwrap();
        assert_ne!(plain_key, prod_key);
        assert_eq!(prod_key.update_count(), plain_key.update_count() + 1);
    }

    #[test]
    fn test_callable_output_parameters_restored_on_hit() {
        let adapter = MockAdapter::with_rows("proc.total", vec![Row::new(vec![], vec![])]);
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = MappedStatement::select("proc.total", "{call total(?, ?)}")
            .statement_type(StatementType::Callable)
            .parameter(ParameterMapping::new("id"))
            .parameter(ParameterMapping::new("total").mode(ParameterMode::Out));

        run(async {
            let mut first = Params::named().with("id", 3i64);
            unwrap_outcome(executor.query(&cx, &statement, &mut first, RowBounds::default()).await);
            assert_eq!(first.get("total"), Some(&Value::BigInt(100)));

            let mut second = Params::named().with("id", 3i64);
            unwrap_outcome(executor.query(&cx, &statement, &mut second, RowBounds::default()).await);
            assert_eq!(second.get("total"), Some(&Value::BigInt(100)));
        });
        assert_eq!(adapter.query_calls(), 1);
        assert_eq!(executor.debug_state().output_parameter_entries, 1);
    }

    #[test]
    fn test_sink_skips_lookup_but_stores_result() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = MappedStatement::select("users.byId", "SELECT * FROM users");

        run(async {
            let mut params = Params::Empty;
            let mut sink = CollectingSink::default();
            unwrap_outcome(
                executor
                    .query_with_sink(&cx, &statement, &mut params, RowBounds::default(), &mut sink)
                    .await,
            );
            assert_eq!(sink.objects.len(), 2);
            unwrap_outcome(
                executor
                    .query_with_sink(&cx, &statement, &mut params, RowBounds::default(), &mut sink)
                    .await,
            );
            assert_eq!(sink.objects.len(), 4);

            // A plain read of the same key is served from what the sink read stored.
            let cached = unwrap_outcome(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            );
            assert_eq!(cached.len(), 2);
        });
        assert_eq!(adapter.query_calls(), 2);
        assert_eq!(executor.debug_state().local_entries, 1);
    }

    #[test]
    fn test_sink_stop_is_honored() {
        struct FirstOnly(Vec<ResultObject>);

        impl ResultSink for FirstOnly {
            fn handle(&mut self, object: ResultObject) {
                self.0.push(object);
            }

            fn stopped(&self) -> bool {
                !self.0.is_empty()
            }
        }

        let mut executor = Executor::new(users_adapter());
        let cx = Cx::for_testing();
        let statement = MappedStatement::select("users.byId", "SELECT * FROM users");
        let mut sink = FirstOnly(Vec::new());
        run(async {
            let mut params = Params::Empty;
            unwrap_outcome(
                executor
                    .query_with_sink(&cx, &statement, &mut params, RowBounds::default(), &mut sink)
                    .await,
            );
        });
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn test_cursor_is_never_cached() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();

        run(async {
            let mut params = Params::named().with("id", 2i64);
            for _ in 0..2 {
                let mut cursor = unwrap_outcome(
                    executor
                        .query_cursor(&cx, &statement, &mut params, RowBounds::default())
                        .await,
                );
                let row = cursor.fetch().unwrap().unwrap();
                assert_eq!(row.get_by_name("name"), Some(&Value::from("Bob")));
            }
        });
        assert_eq!(adapter.state.lock().cursor_calls, 2);
        assert_eq!(executor.debug_state().local_entries, 0);
    }

    #[test]
    fn test_commit_sequence() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();
        let insert = MappedStatement::new(
            "users.insert",
            stmtcache_core::SqlCommandType::Insert,
            "INSERT INTO users (name) VALUES (?)",
        );

        run(async {
            let mut params = Params::named().with("id", 1i64);
            unwrap_outcome(executor.query(&cx, &statement, &mut params, RowBounds::default()).await);
            let mut row = Params::named().with("name", "Carol");
            unwrap_outcome(executor.batch(&cx, &insert, &mut row).await);
            unwrap_outcome(executor.query(&cx, &statement, &mut params, RowBounds::default()).await);
            assert_eq!(executor.debug_state().local_entries, 1);

            unwrap_outcome(executor.commit(&cx, false).await);
            assert_eq!(executor.debug_state().local_entries, 0);
            unwrap_outcome(executor.commit(&cx, true).await);
        });

        let state = adapter.state.lock();
        assert_eq!(state.batch_calls, 1);
        assert_eq!(state.flushes, vec![false, false]);
        assert_eq!(state.commit_calls, 1);
    }

    #[test]
    fn test_commit_skips_resource_commit_after_flush_failure() {
        let adapter = users_adapter();
        adapter.state.lock().fail_flush = true;
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();

        let err = run(async { expect_err(executor.commit(&cx, true).await) });
        assert!(matches!(err, Error::Query(_)));
        let state = adapter.state.lock();
        assert_eq!(state.flushes, vec![false]);
        assert_eq!(state.commit_calls, 0);
    }

    #[test]
    fn test_rollback_attempted_even_if_flush_fails() {
        let adapter = users_adapter();
        adapter.state.lock().fail_flush = true;
        adapter.state.lock().fail_rollback = true;
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();

        run(async {
            let err = expect_err(executor.rollback(&cx, true).await);
            // The flush failure is primary; the rollback failure is only logged.
            assert!(matches!(err, Error::Query(_)));
        });

        let state = adapter.state.lock();
        assert_eq!(state.flushes, vec![true]);
        assert_eq!(state.rollback_calls, 1);
    }

    #[test]
    fn test_close_is_terminal() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();

        run(async {
            let mut params = Params::named().with("id", 1i64);
            unwrap_outcome(executor.query(&cx, &statement, &mut params, RowBounds::default()).await);
            executor.close(&cx, true).await;
            executor.close(&cx, true).await;

            assert!(executor.is_closed());
            assert!(expect_err(executor.query(&cx, &statement, &mut params, RowBounds::default()).await).is_closed_scope());
            assert!(expect_err(executor.update(&cx, &statement, &mut params).await).is_closed_scope());
            assert!(expect_err(executor.flush_statements(&cx).await).is_closed_scope());
            assert!(expect_err(executor.commit(&cx, true).await).is_closed_scope());
            // Rollback after close is a no-op.
            unwrap_outcome(executor.rollback(&cx, true).await);
        });

        assert!(executor.adapter().unwrap_err().is_closed_scope());
        let bound = statement.bound_sql(&Params::Empty);
        assert!(executor
            .create_cache_key(&statement, &Params::Empty, RowBounds::default(), &bound)
            .unwrap_err()
            .is_closed_scope());
        let state = adapter.state.lock();
        assert_eq!(state.rollback_calls, 1);
        assert_eq!(state.close_calls, 1);
        assert_eq!(state.query_calls, 1);
    }

    #[test]
    fn test_close_swallows_rollback_failure() {
        let adapter = users_adapter();
        adapter.state.lock().fail_rollback = true;
        adapter.state.lock().fail_close = true;
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        run(executor.close(&cx, true));
        assert!(executor.is_closed());
        let state = adapter.state.lock();
        assert_eq!(state.rollback_calls, 1);
        assert_eq!(state.close_calls, 1);
    }

    #[test]
    fn test_rollback_failure_surfaces_without_flush_failure() {
        let adapter = users_adapter();
        adapter.state.lock().fail_rollback = true;
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();

        let err = run(async { expect_err(executor.rollback(&cx, true).await) });
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::Rollback,
                ..
            })
        ));
    }

    fn node_row(id: i64, parent_id: i64) -> Row {
        Row::new(
            vec!["id".to_string(), "parent_id".to_string()],
            vec![Value::BigInt(id), Value::BigInt(parent_id)],
        )
    }

    fn node_by_id() -> MappedStatement {
        MappedStatement::select("nodes.byId", "SELECT * FROM nodes WHERE id = ?")
            .parameter(ParameterMapping::new("id"))
    }

    /// Node by id, with its parent (and the parent's parent) mapped through
    /// nested selects of the same statement.
    fn node_with_parents() -> MappedStatement {
        let leaf = Arc::new(node_by_id());
        let middle = Arc::new(node_by_id().result_mapper(
            NestedSelectMapper::new("Node").nested(
                NestedSelect::new("parent", leaf, "parent_id", TargetType::One).parameter("id"),
            ),
        ));
        node_by_id().result_mapper(
            NestedSelectMapper::new("Node").nested(
                NestedSelect::new("parent", middle, "parent_id", TargetType::One).parameter("id"),
            ),
        )
    }

    fn node_cycle_adapter() -> MockAdapter {
        MockAdapter::with_rows("nodes.byId", vec![node_row(1, 2), node_row(2, 1)])
    }

    #[test]
    fn test_cyclic_association_resolved_by_deferred_load() {
        let adapter = node_cycle_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let top = node_with_parents();

        let result = run(async {
            let mut params = Params::named().with("id", 1i64);
            unwrap_outcome(executor.query(&cx, &top, &mut params, RowBounds::default()).await)
        });

        let one = &result[0];
        let two = one.one("parent").unwrap();
        assert_eq!(two.value("id"), Some(Value::BigInt(2)));
        let back = two.one("parent").unwrap();
        assert!(back.ptr_eq(one));

        assert_eq!(adapter.query_calls(), 2);
        let debug = executor.debug_state();
        assert_eq!(debug.deferred_loads, 0);
        assert_eq!(debug.query_depth, 0);
    }

    #[test]
    fn test_sink_query_key_is_in_flight_for_nested_selects() {
        let adapter = node_cycle_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let top = node_with_parents();
        let mut sink = CollectingSink::default();

        run(async {
            let mut params = Params::named().with("id", 1i64);
            unwrap_outcome(
                executor
                    .query_with_sink(&cx, &top, &mut params, RowBounds::default(), &mut sink)
                    .await,
            );
        });

        assert_eq!(sink.objects.len(), 1);
        let one = &sink.objects[0];
        let two = one.one("parent").unwrap();
        assert_eq!(two.value("id"), Some(Value::BigInt(2)));
        // Node 2's parent was deferred against the sink read's in-flight key.
        assert!(two.one("parent").unwrap().ptr_eq(one));
        assert_eq!(adapter.query_calls(), 2);
        let debug = executor.debug_state();
        assert_eq!(debug.deferred_loads, 0);
        assert_eq!(debug.query_depth, 0);
    }

    #[test]
    fn test_dropped_query_leaves_no_depth_or_in_flight_marker() {
        let adapter = users_adapter();
        adapter.state.lock().hang_on = Some("users.byId".to_string());
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();
        let mut params = Params::named().with("id", 1i64);

        let polled = poll_once(executor.query(&cx, &statement, &mut params, RowBounds::default()));
        assert!(polled.is_pending());
        let debug = executor.debug_state();
        assert_eq!(debug.query_depth, 0);
        assert_eq!(debug.local_entries, 0);

        adapter.state.lock().hang_on = None;
        let result = run(async {
            unwrap_outcome(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            )
        });
        assert_eq!(result.len(), 1);
        assert_eq!(adapter.query_calls(), 2);
    }

    #[test]
    fn test_abandoned_query_state_is_dropped_by_next_call() {
        let adapter = node_cycle_adapter();
        adapter.state.lock().hang_on = Some("tags.byNode".to_string());
        let config = ExecutorConfig::new().local_cache_scope(LocalCacheScope::Statement);
        let mut executor = Executor::with_config(adapter.clone(), config);
        let cx = Cx::for_testing();

        let leaf = Arc::new(node_by_id());
        let middle = Arc::new(node_by_id().result_mapper(
            NestedSelectMapper::new("Node").nested(
                NestedSelect::new("parent", leaf, "parent_id", TargetType::One).parameter("id"),
            ),
        ));
        let tags = Arc::new(
            MappedStatement::select("tags.byNode", "SELECT * FROM tags WHERE node_id = ?")
                .parameter(ParameterMapping::new("node_id")),
        );
        let top = node_by_id().result_mapper(
            NestedSelectMapper::new("Node")
                .nested(
                    NestedSelect::new("parent", middle, "parent_id", TargetType::One)
                        .parameter("id"),
                )
                .nested(
                    NestedSelect::new("tags", tags, "id", TargetType::Many).parameter("node_id"),
                ),
        );

        // Node 2's parent is deferred, node 2 is stored, then the tags read hangs.
        let mut params = Params::named().with("id", 1i64);
        let polled = poll_once(executor.query(&cx, &top, &mut params, RowBounds::default()));
        assert!(polled.is_pending());
        let debug = executor.debug_state();
        assert_eq!(debug.query_depth, 0);
        assert_eq!(debug.deferred_loads, 1);
        assert_eq!(debug.local_entries, 1);
        assert_eq!(adapter.query_calls(), 3);

        // STATEMENT scope: node 2 is read again rather than served from the
        // abandoned call's leftovers.
        let mut params = Params::named().with("id", 2i64);
        let statement = node_by_id();
        run(async {
            unwrap_outcome(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            );
        });
        assert_eq!(adapter.query_calls(), 4);
        let debug = executor.debug_state();
        assert_eq!(debug.deferred_loads, 0);
        assert_eq!(debug.local_entries, 0);
    }

    #[derive(Debug)]
    struct PanickingMapper;

    impl ResultMapper for PanickingMapper {
        fn map_rows<'a>(
            &'a self,
            _nested: &'a mut dyn NestedQuery,
            _cx: &'a Cx,
            rows: Vec<Row>,
        ) -> BoxFuture<'a, Outcome<Vec<ResultObject>, Error>> {
            Box::pin(async move {
                if rows.is_empty() {
                    return Outcome::Ok(Vec::new());
                }
                panic!("mapper failed on {} rows", rows.len())
            })
        }
    }

    #[test]
    fn test_unwinding_mapper_leaves_no_depth_or_in_flight_marker() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let broken = users_by_id().result_mapper(PanickingMapper);
        let mut params = Params::named().with("id", 1i64);

        let unwound = catch_unwind(AssertUnwindSafe(|| {
            poll_once(executor.query(&cx, &broken, &mut params, RowBounds::default()))
        }));
        assert!(unwound.is_err());
        let debug = executor.debug_state();
        assert_eq!(debug.query_depth, 0);
        assert_eq!(debug.local_entries, 0);

        // Same key, working mapper: runs again instead of failing as recursive.
        let statement = users_by_id();
        let result = run(async {
            unwrap_outcome(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            )
        });
        assert_eq!(result.len(), 1);
        assert_eq!(adapter.query_calls(), 2);
    }

    #[test]
    fn test_defer_load_on_present_key_assigns_immediately() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id();
        let mut params = Params::named().with("id", 2i64);
        let bound = statement.bound_sql(&params);
        let key = executor
            .create_cache_key(&statement, &params, RowBounds::default(), &bound)
            .unwrap();

        run(async {
            unwrap_outcome(executor.query(&cx, &statement, &mut params, RowBounds::default()).await);
        });

        let target = ResultObject::new("Post");
        NestedQuery::defer_load(&mut executor, &target, "readers", key, TargetType::Many).unwrap();
        assert_eq!(target.many("readers").len(), 1);
        assert_eq!(executor.debug_state().deferred_loads, 0);
    }

    #[derive(Debug)]
    struct ReenteringMapper {
        statement: Arc<MappedStatement>,
    }

    impl ResultMapper for ReenteringMapper {
        fn map_rows<'a>(
            &'a self,
            nested: &'a mut dyn NestedQuery,
            cx: &'a Cx,
            _rows: Vec<Row>,
        ) -> BoxFuture<'a, Outcome<Vec<ResultObject>, Error>> {
            Box::pin(async move {
                let mut params = Params::named().with("id", 1i64);
                match nested
                    .query(cx, &self.statement, &mut params, RowBounds::default())
                    .await
                {
                    Outcome::Ok(result) => Outcome::Ok(result.to_vec()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            })
        }
    }

    #[test]
    fn test_direct_reentry_of_in_flight_key_fails_cleanly() {
        let adapter = users_adapter();
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();
        let statement = users_by_id().result_mapper(ReenteringMapper {
            statement: Arc::new(users_by_id()),
        });

        run(async {
            let mut params = Params::named().with("id", 1i64);
            let err = expect_err(
                executor
                    .query(&cx, &statement, &mut params, RowBounds::default())
                    .await,
            );
            assert!(matches!(
                &err,
                Error::Executor(e) if e.kind == ExecutorErrorKind::RecursiveQuery
            ));
            assert_eq!(err.statement_id(), Some("users.byId"));
        });

        let debug = executor.debug_state();
        assert_eq!(debug.local_entries, 0);
        assert_eq!(debug.query_depth, 0);
        assert_eq!(adapter.query_calls(), 1);
    }

    #[test]
    fn test_many_association_runs_nested_query_once_per_key() {
        let adapter = MockAdapter::default();
        adapter.add_rows(
            "posts.all",
            vec![
                Row::new(
                    vec!["id".to_string(), "author_id".to_string()],
                    vec![Value::BigInt(10), Value::BigInt(1)],
                ),
                Row::new(
                    vec!["id".to_string(), "author_id".to_string()],
                    vec![Value::BigInt(11), Value::BigInt(1)],
                ),
            ],
        );
        adapter.add_rows("users.byId", vec![user_row(1, "Alice")]);
        let mut executor = Executor::new(adapter.clone());
        let cx = Cx::for_testing();

        let posts = MappedStatement::select("posts.all", "SELECT * FROM posts").result_mapper(
            NestedSelectMapper::new("Post").nested(
                NestedSelect::new("author", Arc::new(users_by_id()), "author_id", TargetType::One)
                    .parameter("id"),
            ),
        );

        let result = run(async {
            let mut params = Params::Empty;
            unwrap_outcome(executor.query(&cx, &posts, &mut params, RowBounds::default()).await)
        });

        assert_eq!(result.len(), 2);
        let first = result[0].one("author").unwrap();
        let second = result[1].one("author").unwrap();
        assert!(first.ptr_eq(&second));
        assert!(matches!(result[0].get("author"), Some(Property::One(Some(_)))));
        // posts.all once, users.byId once; the second author comes from the local cache.
        assert_eq!(adapter.query_calls(), 2);
    }
}
