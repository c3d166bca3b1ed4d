//! Deferred property assignments.

use crate::local::LocalCache;
use stmtcache_core::{CacheKey, ResultObject, Result, TargetType};

/// A property assignment waiting for its source query to become present.
#[derive(Debug)]
pub(crate) struct DeferredLoad {
    target: ResultObject,
    property: String,
    key: CacheKey,
    target_type: TargetType,
}

impl DeferredLoad {
    pub(crate) fn new(
        target: &ResultObject,
        property: &str,
        key: CacheKey,
        target_type: TargetType,
    ) -> Self {
        Self {
            target: target.clone(),
            property: property.to_string(),
            key,
            target_type,
        }
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn property(&self) -> &str {
        &self.property
    }

    /// Present, and not merely in flight.
    pub(crate) fn can_load(&self, local: &LocalCache) -> bool {
        local.present(&self.key).is_some()
    }

    /// Assign the property. Returns `Ok(false)` when the source is not present.
    #[allow(clippy::result_large_err)]
    pub(crate) fn load(&self, local: &LocalCache) -> Result<bool> {
        let Some(result) = local.present(&self.key) else {
            return Ok(false);
        };
        let value = self.target_type.extract(&result)?;
        self.target.set(self.property.clone(), value);
        Ok(true)
    }
}
