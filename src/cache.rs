//! Memoisation cache.
//!
//! A [MemoCache] is an explicit object owned by whichever component needs memoisation and passed
//! to it by reference. Entries are keyed by the identity of the memoised function together with
//! its arguments, and expire after a fixed lifespan.

use cached::{Cached, TimedSizedCache};
use std::future::Future;
use std::sync::Mutex;

/// Key of a memoised call: function identity plus its arguments.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    function: &'static str,
    args: Vec<String>,
}

impl CacheKey {
    /// Return a new CacheKey.
    ///
    /// # Arguments
    ///
    /// * `function`: Name identifying the memoised function
    /// * `args`: The function's arguments, in order
    pub fn new(function: &'static str, args: &[&str]) -> Self {
        CacheKey {
            function,
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// Time- and size-bounded memoisation cache.
pub struct MemoCache<V> {
    /// `None` when caching is disabled.
    inner: Option<Mutex<TimedSizedCache<CacheKey, V>>>,
}

impl<V: Clone> MemoCache<V> {
    /// Create a cache.
    ///
    /// # Arguments
    ///
    /// * `capacity`: Maximum number of entries
    /// * `lifespan`: Entry lifespan in seconds. Zero disables caching.
    pub fn new(capacity: usize, lifespan: u64) -> Self {
        let inner = (lifespan > 0 && capacity > 0)
            .then(|| Mutex::new(TimedSizedCache::with_size_and_lifespan(capacity, lifespan)));
        Self { inner }
    }

    /// Returns a cached value if present and not expired.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.cache_get(key).cloned()
    }

    /// Store a value.
    pub fn set(&self, key: CacheKey, value: V) {
        if let Some(inner) = &self.inner {
            let mut cache = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.cache_set(key, value);
        }
    }

    /// Returns the cached value for `key`, or evaluates `init`, caching a successful result.
    ///
    /// The lock is not held while `init` runs, so concurrent misses for the same key may each
    /// evaluate it.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: CacheKey, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            tracing::trace!(function = key.function, "cache hit");
            return Ok(value);
        }
        let value = init().await?;
        self.set(key, value.clone());
        Ok(value)
    }
}
