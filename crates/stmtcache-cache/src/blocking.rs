//! Stampede-safe locking decorator.
//!
//! [`BlockingCache`] gives each key a one-shot gate. The first caller to miss
//! on a key keeps the gate and is expected to fill the entry; every other
//! caller asking for that key waits on the gate until the filler calls
//! [`Cache::put`] or [`Cache::remove`].
//!
//! A `get` that returns `Ok(None)` leaves the gate held. The caller MUST
//! follow up with `put` (store the computed value) or `remove` (abandon the
//! fill) for the same key, or every other caller for that key blocks forever.
//!
//! ```rust,ignore
//! match cache.get(&cx, &key)? {
//!     Some(value) => value,
//!     None => match compute() {
//!         Ok(value) => {
//!             cache.put(key, value.clone())?;
//!             value
//!         }
//!         Err(e) => {
//!             cache.remove(&key)?;
//!             return Err(e);
//!         }
//!     },
//! }
//! ```

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stmtcache_core::{Cache, CacheError, CacheErrorKind, CacheKey, Cx, Error, Result};

/// Upper bound on a single condvar wait, so blocked callers notice cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One-shot gate: created closed, opened once by the releasing caller.
#[derive(Debug)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

enum GateWait {
    Opened,
    TimedOut,
    Cancelled,
}

impl Gate {
    fn new_closed() -> Self {
        Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self, cx: &Cx, deadline: Option<Instant>) -> GateWait {
        let mut open = self.open.lock();
        loop {
            if *open {
                return GateWait::Opened;
            }
            if cx.is_cancel_requested() {
                return GateWait::Cancelled;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return GateWait::TimedOut;
                    }
                    (deadline - now).min(CANCEL_POLL_INTERVAL)
                }
                None => CANCEL_POLL_INTERVAL,
            };
            let _ = self.cv.wait_for(&mut open, slice);
        }
    }
}

/// Locking decorator over any [`Cache`].
///
/// At most one caller at a time is between a miss and the matching
/// `put`/`remove` for a given key. The gate table is a concurrent map, so the
/// decorator needs no external synchronization.
pub struct BlockingCache<V, C> {
    delegate: C,
    gates: DashMap<CacheKey, Arc<Gate>>,
    timeout: Mutex<Option<Duration>>,
    _value: PhantomData<fn() -> V>,
}

impl<V, C> BlockingCache<V, C>
where
    C: Cache<V>,
{
    /// Wrap `delegate`; waits are unbounded until a timeout is set.
    pub fn new(delegate: C) -> Self {
        Self {
            delegate,
            gates: DashMap::new(),
            timeout: Mutex::new(None),
            _value: PhantomData,
        }
    }

    /// Bound every wait on a gate. Zero means wait forever.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Change the wait bound. Zero means wait forever.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = (!timeout.is_zero()).then_some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// Number of gates currently held.
    pub fn held_gates(&self) -> usize {
        self.gates.len()
    }

    pub fn delegate(&self) -> &C {
        &self.delegate
    }

    #[allow(clippy::result_large_err)]
    fn acquire_gate(&self, cx: &Cx, key: &CacheKey) -> Result<()> {
        let timeout = self.timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let gate = match self.gates.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Gate::new_closed()));
                    tracing::trace!(cache = %self.delegate.id(), key = %key, "gate acquired");
                    return Ok(());
                }
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            };

            tracing::trace!(cache = %self.delegate.id(), key = %key, "waiting on gate");
            match gate.wait(cx, deadline) {
                GateWait::Opened => {}
                GateWait::TimedOut => {
                    let waited = timeout.unwrap_or_default();
                    tracing::debug!(
                        cache = %self.delegate.id(),
                        key = %key,
                        timeout_ms = waited.as_millis() as u64,
                        "gate wait timed out"
                    );
                    return Err(Error::Cache(CacheError {
                        kind: CacheErrorKind::LockTimeout,
                        cache_id: self.delegate.id().to_string(),
                        key: Some(key.to_string()),
                        message: format!(
                            "Couldn't get a lock in {:?} for the key {} at the cache {}",
                            waited,
                            key,
                            self.delegate.id()
                        ),
                    }));
                }
                GateWait::Cancelled => {
                    return Err(Error::Cache(CacheError {
                        kind: CacheErrorKind::Cancelled,
                        cache_id: self.delegate.id().to_string(),
                        key: Some(key.to_string()),
                        message: format!(
                            "Cancelled while waiting for the lock on key {} at the cache {}",
                            key,
                            self.delegate.id()
                        ),
                    }));
                }
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn release_gate(&self, key: &CacheKey) -> Result<()> {
        match self.gates.remove(key) {
            Some((_, gate)) => {
                gate.open();
                tracing::trace!(cache = %self.delegate.id(), key = %key, "gate released");
                Ok(())
            }
            None => Err(Error::Cache(CacheError {
                kind: CacheErrorKind::LockProtocol,
                cache_id: self.delegate.id().to_string(),
                key: Some(key.to_string()),
                message: format!(
                    "Detected an attempt at releasing unacquired lock for the key {}. This should never happen.",
                    key
                ),
            })),
        }
    }
}

impl<V, C> Cache<V> for BlockingCache<V, C>
where
    C: Cache<V>,
    V: Send + Sync,
{
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }

    /// Writes through, then releases the key's gate even if the write failed.
    fn put(&self, key: CacheKey, value: V) -> Result<()> {
        let written = self.delegate.put(key.clone(), value);
        let released = self.release_gate(&key);
        written.and(released)
    }

    /// A hit releases the gate at once; a miss leaves it held for the caller.
    fn get(&self, cx: &Cx, key: &CacheKey) -> Result<Option<V>> {
        self.acquire_gate(cx, key)?;
        let value = match self.delegate.get(cx, key) {
            Ok(value) => value,
            Err(e) => {
                // Nobody will put after a failed read.
                if let Err(release_err) = self.release_gate(key) {
                    tracing::warn!(error = %release_err, "gate release after failed read");
                }
                return Err(e);
            }
        };
        if value.is_some() {
            self.release_gate(key)?;
        }
        Ok(value)
    }

    /// Releases the key's gate. The delegate's entry is left alone.
    fn remove(&self, key: &CacheKey) -> Result<Option<V>> {
        self.release_gate(key)?;
        Ok(None)
    }

    fn clear(&self) -> Result<()> {
        self.delegate.clear()
    }
}

impl<V, C> fmt::Debug for BlockingCache<V, C>
where
    C: Cache<V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingCache")
            .field("id", &self.delegate.id())
            .field("held_gates", &self.gates.len())
            .field("timeout", &self.timeout())
            .finish()
    }
}
