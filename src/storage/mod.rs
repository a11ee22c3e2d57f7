//! Storage backend trait and implementations.
//!
//! Rate-limit state lives in a key→string store with per-key TTLs. A
//! backend may additionally advertise *atomic primitives* (server-side
//! read-modify-write operations for the rate-limit algorithms), which
//! the rules prefer over their optimistic-CAS fallback whenever present.

mod json_guard;
#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use json_guard::parse_state_json;

#[cfg(feature = "memory")]
pub use memory::{MemoryConfig, MemoryStorage};

#[cfg(feature = "redis")]
pub use redis::{RedisConfig, RedisStorage};

use std::future::Future;
use std::time::Duration;

use crate::error::{ConfigError, Result, StorageError};

/// Outcome of an atomic rate-limit primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicOutcome {
    /// Whether the event was admitted.
    pub allowed: bool,
    /// Remaining budget after this call.
    pub remaining: u64,
    /// When the budget resets (epoch milliseconds).
    pub reset_at: u64,
}

/// Which atomic primitives a backend advertises.
///
/// Rules consult this before each evaluation; a `false` field routes the
/// rule onto its generic CAS fallback for that algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageCapabilities {
    /// `token_bucket` is atomic server-side.
    pub token_bucket: bool,
    /// `sliding_window` is atomic server-side.
    pub sliding_window: bool,
    /// `fixed_window` is atomic server-side.
    pub fixed_window: bool,
    /// `acquire_concurrency`/`release_concurrency` are atomic server-side.
    pub concurrency: bool,
}

impl StorageCapabilities {
    /// A backend with every primitive.
    pub fn all() -> Self {
        Self {
            token_bucket: true,
            sliding_window: true,
            fixed_window: true,
            concurrency: true,
        }
    }
}

/// Storage backend for admission state.
///
/// All operations are async to support both local and distributed
/// backends; implementations must be `Send + Sync`. Values are opaque
/// strings; JSON is parsed at the rule layer with size and nesting
/// limits. TTLs are milliseconds; adapters may floor to whole seconds.
pub trait Storage: Send + Sync + 'static {
    /// Get a value by key. `None` if absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Set a value with an optional TTL.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a key. Succeeds even if the key didn't exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Atomically add `delta` to a numeric value, creating it at zero.
    /// Returns the value after the increment.
    fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Replace `key` only if its current raw value is byte-identical to
    /// `expected` (`None` = key absent). Returns whether the swap took
    /// effect. This is the seam the optimistic CAS fallback builds on.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Which atomic primitives this backend supports.
    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::default()
    }

    /// Atomic token bucket: refill by elapsed whole intervals, then try
    /// to take `requested` tokens.
    fn token_bucket(
        &self,
        _key: &str,
        _capacity: u64,
        _refill_rate: u64,
        _interval_ms: u64,
        _requested: u64,
    ) -> impl Future<Output = Result<AtomicOutcome>> + Send {
        async {
            Err(StorageError::operation_failed("token_bucket", "not supported by this backend", false).into())
        }
    }

    /// Atomic sliding window: drop entries older than the window, admit
    /// if fewer than `max` remain.
    fn sliding_window(
        &self,
        _key: &str,
        _max: u64,
        _window_ms: u64,
    ) -> impl Future<Output = Result<AtomicOutcome>> + Send {
        async {
            Err(StorageError::operation_failed("sliding_window", "not supported by this backend", false).into())
        }
    }

    /// Atomic fixed window counter.
    fn fixed_window(
        &self,
        _key: &str,
        _max: u64,
        _window_ms: u64,
    ) -> impl Future<Output = Result<AtomicOutcome>> + Send {
        async {
            Err(StorageError::operation_failed("fixed_window", "not supported by this backend", false).into())
        }
    }

    /// Atomically acquire a concurrency slot for `req_id`, expiring it
    /// after `timeout_ms` in case the release never arrives.
    fn acquire_concurrency(
        &self,
        _key: &str,
        _max: u64,
        _req_id: &str,
        _timeout_ms: u64,
    ) -> impl Future<Output = Result<AtomicOutcome>> + Send {
        async {
            Err(StorageError::operation_failed("acquire_concurrency", "not supported by this backend", false).into())
        }
    }

    /// Release a previously acquired concurrency slot.
    fn release_concurrency(
        &self,
        _key: &str,
        _req_id: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        async {
            Err(StorageError::operation_failed("release_concurrency", "not supported by this backend", false).into())
        }
    }
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        (**self).increment(key, delta, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        (**self).compare_and_swap(key, expected, new, ttl).await
    }

    fn capabilities(&self) -> StorageCapabilities {
        (**self).capabilities()
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: u64,
        interval_ms: u64,
        requested: u64,
    ) -> Result<AtomicOutcome> {
        (**self)
            .token_bucket(key, capacity, refill_rate, interval_ms, requested)
            .await
    }

    async fn sliding_window(&self, key: &str, max: u64, window_ms: u64) -> Result<AtomicOutcome> {
        (**self).sliding_window(key, max, window_ms).await
    }

    async fn fixed_window(&self, key: &str, max: u64, window_ms: u64) -> Result<AtomicOutcome> {
        (**self).fixed_window(key, max, window_ms).await
    }

    async fn acquire_concurrency(
        &self,
        key: &str,
        max: u64,
        req_id: &str,
        timeout_ms: u64,
    ) -> Result<AtomicOutcome> {
        (**self)
            .acquire_concurrency(key, max, req_id, timeout_ms)
            .await
    }

    async fn release_concurrency(&self, key: &str, req_id: &str) -> Result<()> {
        (**self).release_concurrency(key, req_id).await
    }
}

/// Validate a storage key prefix: `^[A-Za-z0-9_\-:]{1,50}$`.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let ok = !prefix.is_empty()
        && prefix.len() <= 50
        && prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':'));
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidStorage(format!("invalid key prefix {prefix:?}")).into())
    }
}

/// Sanitize a user-supplied key component and cap its length.
pub fn sanitize_key_component(component: &str) -> String {
    let mut out: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '|') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(512);
    out
}
