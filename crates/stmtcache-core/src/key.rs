//! Order-sensitive composite cache keys.

use crate::value::Value;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

const DEFAULT_MULTIPLIER: i64 = 37;
const DEFAULT_HASHCODE: i64 = 17;

/// A composite key built by a sequence of [`CacheKey::update`] steps.
///
/// The hash and a checksum are accumulated as parts are added, so keys are
/// compared cheaply before the parts themselves are inspected. Two keys built
/// from the same sequence of parts are equal and hash-equal; the order of the
/// parts matters.
#[derive(Clone)]
pub struct CacheKey {
    multiplier: i64,
    hashcode: i64,
    checksum: i64,
    count: usize,
    parts: Vec<Value>,
}

impl CacheKey {
    /// Create an empty key.
    pub fn new() -> Self {
        Self {
            multiplier: DEFAULT_MULTIPLIER,
            hashcode: DEFAULT_HASHCODE,
            checksum: 0,
            count: 0,
            parts: Vec::new(),
        }
    }

    /// Create a key from an ordered list of parts.
    pub fn from_parts<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut key = Self::new();
        for part in parts {
            key.update(part);
        }
        key
    }

    /// Append one part to the key.
    pub fn update(&mut self, part: impl Into<Value>) {
        let part = part.into();
        let base = base_hash(&part);

        self.count += 1;
        self.checksum = self.checksum.wrapping_add(base);
        let weighted = base.wrapping_mul(self.count as i64);
        self.hashcode = self
            .multiplier
            .wrapping_mul(self.hashcode)
            .wrapping_add(weighted);

        self.parts.push(part);
    }

    /// Append every part of `parts`, in order.
    pub fn update_all<I, V>(&mut self, parts: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        for part in parts {
            self.update(part);
        }
    }

    /// Number of parts added so far.
    pub fn update_count(&self) -> usize {
        self.count
    }

    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// The accumulated hash code.
    pub fn hashcode(&self) -> i64 {
        self.hashcode
    }
}

impl Default for CacheKey {
    fn default() -> Self {
        Self::new()
    }
}

fn base_hash(part: &Value) -> i64 {
    if part.is_null() {
        return 1;
    }
    let mut hasher = DefaultHasher::new();
    part.hash_into(&mut hasher);
    hasher.finish() as i64
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        if self.hashcode != other.hashcode
            || self.checksum != other.checksum
            || self.count != other.count
        {
            return false;
        }
        self.parts
            .iter()
            .zip(&other.parts)
            .all(|(a, b)| a.same_as(b))
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hashcode.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hashcode, self.checksum)?;
        for part in &self.parts {
            write!(f, ":{part}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}
