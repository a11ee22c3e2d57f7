//! In-memory storage backend.
//!
//! Uses `DashMap` for thread-safe concurrent access. Every key carries a
//! TTL (with a 24 h safety default) and the map is capped at a configured
//! number of keys; when full, expired entries are purged first and then
//! the least-recently-touched keys are evicted. All atomic primitives are
//! implemented against the per-key entry lock, so this backend advertises
//! the full capability set.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::Clock;
use crate::error::{Result, StorageError};
use crate::storage::{AtomicOutcome, Storage, StorageCapabilities};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of keys before least-recently-touched eviction.
    pub max_keys: usize,
    /// Safety TTL applied when a write carries no explicit TTL.
    pub default_ttl: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_keys: 10_000,
            default_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: u64,
    last_touch: u64,
}

/// Token-bucket state as stored by the atomic primitive.
#[derive(Debug, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

/// Concurrency slots: request id → slot expiry.
type SlotMap = BTreeMap<String, u64>;

/// In-memory storage with TTL autopurge and LRU-style eviction.
pub struct MemoryStorage {
    data: DashMap<String, Entry>,
    config: MemoryConfig,
    clock: Clock,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.data.len())
            .field("max_keys", &self.config.max_keys)
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a memory storage with the default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Create a memory storage with a custom configuration.
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            data: DashMap::new(),
            config,
            clock: Clock::system(),
        }
    }

    /// Replace the time source. Tests pin a fixed clock here.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.data.clear();
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn expiry_for(&self, ttl: Option<Duration>) -> u64 {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.now_ms() + ttl.as_millis() as u64
    }

    /// Purge expired entries; if still above capacity, evict the
    /// least-recently-touched keys until back under.
    fn enforce_capacity(&self) {
        if self.data.len() <= self.config.max_keys {
            return;
        }
        let now = self.now_ms();
        self.data.retain(|_, entry| entry.expires_at > now);

        while self.data.len() > self.config.max_keys {
            let mut oldest: Option<(String, u64)> = None;
            for item in self.data.iter() {
                match &oldest {
                    Some((_, touch)) if *touch <= item.last_touch => {}
                    _ => oldest = Some((item.key().clone(), item.last_touch)),
                }
            }
            match oldest {
                Some((key, _)) => {
                    self.data.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Read-modify-write under the per-key entry lock.
    fn update_state<T, F>(&self, key: &str, ttl: Duration, op: F) -> Result<T>
    where
        F: FnOnce(Option<&str>, u64) -> Result<(String, T)>,
    {
        let now = self.now_ms();
        let expires_at = now + ttl.as_millis() as u64;

        let mut slot = self.data.entry(key.to_string()).or_insert(Entry {
            value: String::new(),
            expires_at,
            last_touch: now,
        });

        let current = if slot.value.is_empty() || slot.expires_at <= now {
            None
        } else {
            Some(slot.value.as_str())
        };

        let (new_value, result) = op(current, now)?;
        slot.value = new_value;
        slot.expires_at = expires_at;
        slot.last_touch = now;
        drop(slot);

        self.enforce_capacity();
        Ok(result)
    }
}

impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now_ms();
        if let Some(mut entry) = self.data.get_mut(key) {
            // Empty values are placeholders left by aborted updates.
            if entry.expires_at > now && !entry.value.is_empty() {
                entry.last_touch = now;
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = self.now_ms();
        let expires_at = self.expiry_for(ttl);
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
                last_touch: now,
            },
        );
        self.enforce_capacity();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.update_state(key, ttl, |current, _| {
            let base: i64 = match current {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| StorageError::Serialization(format!("non-numeric counter {raw:?}")))?,
                None => 0,
            };
            let next = base.saturating_add(delta);
            Ok((next.to_string(), next))
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        use dashmap::mapref::entry::Entry as MapEntry;

        let now = self.now_ms();
        let expires_at = self.expiry_for(ttl);
        let fresh = Entry {
            value: new.to_string(),
            expires_at,
            last_touch: now,
        };

        let matches = match self.data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let slot = occupied.get();
                let current = if slot.value.is_empty() || slot.expires_at <= now {
                    None
                } else {
                    Some(slot.value.as_str())
                };
                if current == expected {
                    occupied.insert(fresh);
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(fresh);
                    true
                } else {
                    false
                }
            }
        };

        if matches {
            self.enforce_capacity();
        }
        Ok(matches)
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
        let ttl = Duration::from_millis(interval_ms.saturating_mul(10).max(1_000));
        self.update_state(key, ttl, |current, now| {
            let mut state = match current {
                Some(raw) => serde_json::from_str::<BucketState>(raw)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
                None => BucketState {
                    tokens: capacity as f64,
                    last_refill: now,
                },
            };

            // Discrete refill: whole elapsed intervals only, phase preserved.
            if now > state.last_refill && interval_ms > 0 {
                let elapsed = now - state.last_refill;
                let periods = elapsed / interval_ms;
                if periods > 0 {
                    state.tokens =
                        (state.tokens + (periods * refill_rate) as f64).min(capacity as f64);
                    state.last_refill += periods * interval_ms;
                }
            }

            let allowed = state.tokens >= requested as f64;
            if allowed {
                state.tokens -= requested as f64;
            }

            let deficit = capacity as f64 - state.tokens;
            let periods_to_full = if deficit <= 0.0 || refill_rate == 0 {
                0
            } else {
                (deficit / refill_rate as f64).ceil() as u64
            };
            let reset_at = state.last_refill + periods_to_full * interval_ms;

            let outcome = AtomicOutcome {
                allowed,
                remaining: state.tokens.floor().max(0.0) as u64,
                reset_at,
            };
            let raw = serde_json::to_string(&state)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok((raw, outcome))
        })
    }

    async fn sliding_window(&self, key: &str, max: u64, window_ms: u64) -> Result<AtomicOutcome> {
        let ttl = Duration::from_millis(window_ms.saturating_mul(2).max(1_000));
        self.update_state(key, ttl, |current, now| {
            let mut timestamps: Vec<u64> = match current {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
                None => Vec::new(),
            };

            let floor = now.saturating_sub(window_ms);
            timestamps.retain(|&ts| ts >= floor);

            let allowed = (timestamps.len() as u64) < max;
            if allowed {
                timestamps.push(now);
            }

            let reset_at = timestamps
                .first()
                .map(|&oldest| oldest + window_ms)
                .unwrap_or(now + window_ms);
            let outcome = AtomicOutcome {
                allowed,
                remaining: max.saturating_sub(timestamps.len() as u64),
                reset_at,
            };
            let raw = serde_json::to_string(&timestamps)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok((raw, outcome))
        })
    }

    async fn fixed_window(&self, key: &str, max: u64, window_ms: u64) -> Result<AtomicOutcome> {
        let ttl = Duration::from_millis(window_ms.saturating_mul(2).max(1_000));
        self.update_state(key, ttl, |current, now| {
            let window_start = if window_ms > 0 { now - now % window_ms } else { now };

            let (stored_start, count) = match current {
                Some(raw) => serde_json::from_str::<(u64, u64)>(raw)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
                None => (window_start, 0),
            };

            let count = if stored_start == window_start { count } else { 0 };
            let allowed = count < max;
            let count = if allowed { count + 1 } else { count };

            let outcome = AtomicOutcome {
                allowed,
                remaining: max.saturating_sub(count),
                reset_at: window_start + window_ms,
            };
            let raw = serde_json::to_string(&(window_start, count))
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok((raw, outcome))
        })
    }

    async fn acquire_concurrency(
        &self,
        key: &str,
        max: u64,
        req_id: &str,
        timeout_ms: u64,
    ) -> Result<AtomicOutcome> {
        let ttl = Duration::from_millis(timeout_ms.saturating_mul(2).max(1_000));
        self.update_state(key, ttl, |current, now| {
            let mut slots: SlotMap = match current {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
                None => SlotMap::new(),
            };

            slots.retain(|_, &mut expiry| expiry > now);

            let allowed = (slots.len() as u64) < max || slots.contains_key(req_id);
            if allowed {
                slots.insert(req_id.to_string(), now + timeout_ms);
            }

            let outcome = AtomicOutcome {
                allowed,
                remaining: max.saturating_sub(slots.len() as u64),
                reset_at: now + timeout_ms,
            };
            let raw = serde_json::to_string(&slots)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok((raw, outcome))
        })
    }

    async fn release_concurrency(&self, key: &str, req_id: &str) -> Result<()> {
        let ttl = self.config.default_ttl;
        self.update_state(key, ttl, |current, _| {
            let mut slots: SlotMap = match current {
                Some(raw) => serde_json::from_str(raw)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
                None => SlotMap::new(),
            };
            slots.remove(req_id);
            let raw = serde_json::to_string(&slots)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok((raw, ()))
        })
    }
}
