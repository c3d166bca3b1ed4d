//! Executor configuration.

use serde::{Deserialize, Serialize};
use stmtcache_core::Result;

/// Lifetime of the executor's local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalCacheScope {
    /// Entries live until commit, rollback, clear or a write.
    #[default]
    Session,
    /// Entries are wiped after every outermost query completes.
    Statement,
}

/// Configuration for [`Executor`](crate::Executor) behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Local cache lifetime.
    pub local_cache_scope: LocalCacheScope,
    /// Identity of the active environment, appended to every cache key when set.
    pub environment_id: Option<String>,
}

impl ExecutorConfig {
    /// Create the default configuration (SESSION scope, no environment).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local cache scope (builder pattern).
    #[must_use]
    pub fn local_cache_scope(mut self, scope: LocalCacheScope) -> Self {
        self.local_cache_scope = scope;
        self
    }

    /// Set the environment identity (builder pattern).
    #[must_use]
    pub fn environment_id(mut self, id: impl Into<String>) -> Self {
        self.environment_id = Some(id.into());
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
