//! The executor's scope-bound local cache.

use stmtcache_cache::PerpetualCache;
use stmtcache_core::{CacheKey, Params, QueryResult};

/// A slot in the local result store. A key with no entry is absent.
#[derive(Debug, Clone)]
pub enum LocalEntry {
    /// The query for this key has started and not yet completed.
    InFlight,
    /// The materialized result, possibly empty.
    Present(QueryResult),
}

/// Result store plus the output-parameter snapshots of call-style statements.
#[derive(Debug)]
pub(crate) struct LocalCache {
    entries: PerpetualCache<LocalEntry>,
    output_parameters: PerpetualCache<Params>,
}

impl LocalCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: PerpetualCache::new("LocalCache"),
            output_parameters: PerpetualCache::new("LocalOutputParameterCache"),
        }
    }

    pub(crate) fn lookup(&self, key: &CacheKey) -> Option<LocalEntry> {
        self.entries.lookup(key)
    }

    pub(crate) fn present(&self, key: &CacheKey) -> Option<QueryResult> {
        match self.entries.lookup(key) {
            Some(LocalEntry::Present(result)) => Some(result),
            _ => None,
        }
    }

    pub(crate) fn mark_in_flight(&self, key: CacheKey) {
        self.entries.insert(key, LocalEntry::InFlight);
    }

    pub(crate) fn store(&self, key: CacheKey, result: QueryResult) {
        self.entries.insert(key, LocalEntry::Present(result));
    }

    pub(crate) fn discard(&self, key: &CacheKey) {
        let _ = self.entries.take(key);
    }

    pub(crate) fn store_output_parameters(&self, key: CacheKey, params: Params) {
        self.output_parameters.insert(key, params);
    }

    pub(crate) fn output_parameters(&self, key: &CacheKey) -> Option<Params> {
        self.output_parameters.lookup(key)
    }

    pub(crate) fn clear(&self) {
        self.entries.clear_entries();
        self.output_parameters.clear_entries();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn output_parameter_len(&self) -> usize {
        self.output_parameters.len()
    }
}
