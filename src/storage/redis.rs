//! Redis storage backend for state shared across process replicas.
//!
//! Every atomic primitive runs as a single server-side Lua script, so no
//! client-side locking is needed. Uses connection pooling, a validated
//! key prefix, and server-clock sampling: when the local clock drifts
//! more than 100 ms from the Redis server, timestamps passed into
//! scripts come from the server instead.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use deadpool_redis::{
    Config, Connection, Pool, Runtime,
    redis::{AsyncCommands, RedisError, Script, cmd},
};

use crate::clock::system_now_ms;
use crate::error::{ConfigError, Result, StorageError};
use crate::storage::{
    AtomicOutcome, Storage, StorageCapabilities, sanitize_key_component, validate_prefix,
};

/// How often the server clock is re-sampled.
const CLOCK_SAMPLE_INTERVAL_MS: u64 = 60_000;

/// Offset beyond which server time replaces local time.
const CLOCK_OFFSET_TOLERANCE_MS: i64 = 100;

/// Backoff ceiling after TIME failures.
const CLOCK_BACKOFF_CAP_MS: u64 = 60_000;

/// Redis storage configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Extra backend namespace on top of the engine's key prefix.
    /// Empty by default; validated to `^[A-Za-z0-9_\-:]{1,50}$` when set.
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: String::new(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

// Atomic primitives, one script each. Scripts receive `now` from the
// client (offset-corrected) so replicas agree on time even when the
// Redis server's clock is authoritative.

const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

if now > last and interval > 0 then
  local periods = math.floor((now - last) / interval)
  if periods > 0 then
    tokens = math.min(capacity, tokens + periods * refill)
    last = last + periods * interval
  end
end

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

local deficit = capacity - tokens
local reset = last
if deficit > 0 and refill > 0 then
  reset = last + math.ceil(deficit / refill) * interval
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last)
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, math.floor(tokens), reset}
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local max = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
local count = redis.call('ZCARD', KEYS[1])

local allowed = 0
if count < max then
  redis.call('ZADD', KEYS[1], now, member)
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], window * 2)

local reset = now + window
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] then
  reset = tonumber(oldest[2]) + window
end
return {allowed, max - count, reset}
"#;

const FIXED_WINDOW_SCRIPT: &str = r#"
local max = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local start = now - now % window
local state = redis.call('HMGET', KEYS[1], 'start', 'count')
local stored = tonumber(state[1])
local count = tonumber(state[2])
if stored ~= start or count == nil then
  count = 0
end

local allowed = 0
if count < max then
  count = count + 1
  allowed = 1
end

redis.call('HSET', KEYS[1], 'start', start, 'count', count)
redis.call('PEXPIRE', KEYS[1], window * 2)
return {allowed, max - count, start + window}
"#;

const ACQUIRE_CONCURRENCY_SCRIPT: &str = r#"
local max = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local timeout = tonumber(ARGV[3])
local req = ARGV[4]

redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now)
local held = redis.call('ZCARD', KEYS[1])
local mine = redis.call('ZSCORE', KEYS[1], req)

local allowed = 0
if mine or held < max then
  redis.call('ZADD', KEYS[1], now + timeout, req)
  if not mine then
    held = held + 1
  end
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], timeout * 2)
return {allowed, max - held, now + timeout}
"#;

const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local expected = ARGV[1]
local matches
if expected == '' then
  matches = (current == false)
else
  matches = (current == expected)
end
if matches then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', tonumber(ARGV[3]))
  return 1
end
return 0
"#;

/// Tracks the offset between the local clock and the Redis server.
struct ClockSync {
    offset_ms: AtomicI64,
    last_sample_at: AtomicU64,
    backoff_until: AtomicU64,
    failures: AtomicU32,
}

impl ClockSync {
    fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            last_sample_at: AtomicU64::new(0),
            backoff_until: AtomicU64::new(0),
            failures: AtomicU32::new(0),
        }
    }

    /// Corrected "now": server time when the offset is past tolerance.
    fn now_ms(&self) -> u64 {
        let local = system_now_ms();
        let offset = self.offset_ms.load(Ordering::Acquire);
        if offset.abs() > CLOCK_OFFSET_TOLERANCE_MS {
            (local as i64 + offset).max(0) as u64
        } else {
            local
        }
    }

    fn due(&self) -> bool {
        let local = system_now_ms();
        if local < self.backoff_until.load(Ordering::Acquire) {
            return false;
        }
        local.saturating_sub(self.last_sample_at.load(Ordering::Acquire)) >= CLOCK_SAMPLE_INTERVAL_MS
    }

    fn record_sample(&self, server_ms: u64) {
        let local = system_now_ms();
        self.offset_ms
            .store(server_ms as i64 - local as i64, Ordering::Release);
        self.last_sample_at.store(local, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.backoff_until.store(0, Ordering::Release);
    }

    fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).min(16);
        let backoff = (1_000u64 << failures).min(CLOCK_BACKOFF_CAP_MS);
        self.backoff_until
            .store(system_now_ms() + backoff, Ordering::Release);
        if failures % 4 == 0 {
            tracing::warn!(failures, backoff_ms = backoff, "redis TIME sampling failed");
        }
    }
}

/// Redis storage backend. All atomic primitives run server-side.
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    clock_sync: ClockSync,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStorage {
    /// Create a new Redis storage from configuration.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        if !config.key_prefix.is_empty() {
            validate_prefix(&config.key_prefix)?;
        }

        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConfigError::InvalidStorage(e.to_string()))?;

        let storage = Self {
            pool,
            key_prefix: config.key_prefix,
            clock_sync: ClockSync::new(),
        };

        // Initial clock sample doubles as the connectivity check.
        let mut conn = storage.get_conn().await?;
        storage.sample_clock(&mut conn).await;

        Ok(storage)
    }

    /// Create a new Redis storage from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, sanitize_key_component(key))
    }

    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| StorageError::PoolExhausted.into())
    }

    async fn sample_clock(&self, conn: &mut Connection) {
        let sampled: std::result::Result<(u64, u64), RedisError> =
            cmd("TIME").query_async(conn).await;
        match sampled {
            Ok((secs, micros)) => {
                self.clock_sync.record_sample(secs * 1_000 + micros / 1_000);
            }
            Err(_) => self.clock_sync.record_failure(),
        }
    }

    /// Corrected timestamp, re-sampling the server clock when due.
    async fn now_ms(&self, conn: &mut Connection) -> u64 {
        if self.clock_sync.due() {
            self.sample_clock(conn).await;
        }
        self.clock_sync.now_ms()
    }

    async fn run_outcome_script(
        &self,
        op: &'static str,
        script: &Script,
        key: &str,
        args: &[String],
    ) -> Result<AtomicOutcome> {
        let mut conn = self.get_conn().await?;
        let mut invocation = script.key(self.full_key(key));
        for arg in args {
            invocation.arg(arg);
        }
        let (allowed, remaining, reset_at): (i64, i64, i64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::operation_failed(op, e.to_string(), true))?;
        Ok(AtomicOutcome {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            reset_at: reset_at.max(0) as u64,
        })
    }
}

impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        let value: Option<String> = conn
            .get(&full_key)
            .await
            .map_err(|e| StorageError::operation_failed("get", e.to_string(), true))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        match ttl {
            Some(ttl) => {
                let ttl_ms = ttl.as_millis().max(1) as u64;
                cmd("SET")
                    .arg(&full_key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<()>(&mut conn)
                    .await
            }
            None => conn.set(&full_key, value).await,
        }
        .map_err(|e| StorageError::operation_failed("set", e.to_string(), true).into())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        conn.del::<_, ()>(&full_key)
            .await
            .map_err(|e| StorageError::operation_failed("delete", e.to_string(), true).into())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        let value: i64 = conn
            .incr(&full_key, delta)
            .await
            .map_err(|e| StorageError::operation_failed("increment", e.to_string(), true))?;
        if let Some(ttl) = ttl {
            let ttl_ms = ttl.as_millis().max(1) as u64;
            let _: std::result::Result<(), _> = cmd("PEXPIRE")
                .arg(&full_key)
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await;
        }
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let script = Script::new(COMPARE_AND_SWAP_SCRIPT);
        let ttl_ms = ttl
            .unwrap_or(Duration::from_secs(24 * 3600))
            .as_millis()
            .max(1) as u64;
        let swapped: i64 = script
            .key(self.full_key(key))
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::operation_failed("compare_and_swap", e.to_string(), true))?;
        Ok(swapped == 1)
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::all()
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: u64,
        interval_ms: u64,
        requested: u64,
    ) -> Result<AtomicOutcome> {
        let mut conn = self.get_conn().await?;
        let now = self.now_ms(&mut conn).await;
        drop(conn);

        let ttl_ms = interval_ms.saturating_mul(10).max(1_000);
        self.run_outcome_script(
            "token_bucket",
            &Script::new(TOKEN_BUCKET_SCRIPT),
            key,
            &[
                capacity.to_string(),
                refill_rate.to_string(),
                interval_ms.to_string(),
                requested.to_string(),
                now.to_string(),
                ttl_ms.to_string(),
            ],
        )
        .await
    }

    async fn sliding_window(&self, key: &str, max: u64, window_ms: u64) -> Result<AtomicOutcome> {
        let mut conn = self.get_conn().await?;
        let now = self.now_ms(&mut conn).await;
        drop(conn);

        // Uniqueness suffix keeps same-millisecond arrivals distinct.
        let member = format!("{now}-{:08x}", rand::random::<u32>());
        self.run_outcome_script(
            "sliding_window",
            &Script::new(SLIDING_WINDOW_SCRIPT),
            key,
            &[
                max.to_string(),
                window_ms.to_string(),
                now.to_string(),
                member,
            ],
        )
        .await
    }

    async fn fixed_window(&self, key: &str, max: u64, window_ms: u64) -> Result<AtomicOutcome> {
        let mut conn = self.get_conn().await?;
        let now = self.now_ms(&mut conn).await;
        drop(conn);

        self.run_outcome_script(
            "fixed_window",
            &Script::new(FIXED_WINDOW_SCRIPT),
            key,
            &[max.to_string(), window_ms.to_string(), now.to_string()],
        )
        .await
    }

    async fn acquire_concurrency(
        &self,
        key: &str,
        max: u64,
        req_id: &str,
        timeout_ms: u64,
    ) -> Result<AtomicOutcome> {
        let mut conn = self.get_conn().await?;
        let now = self.now_ms(&mut conn).await;
        drop(conn);

        self.run_outcome_script(
            "acquire_concurrency",
            &Script::new(ACQUIRE_CONCURRENCY_SCRIPT),
            key,
            &[
                max.to_string(),
                now.to_string(),
                timeout_ms.to_string(),
                req_id.to_string(),
            ],
        )
        .await
    }

    async fn release_concurrency(&self, key: &str, req_id: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let full_key = self.full_key(key);
        cmd("ZREM")
            .arg(&full_key)
            .arg(req_id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                StorageError::operation_failed("release_concurrency", e.to_string(), true).into()
            })
    }
}
