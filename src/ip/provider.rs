//! Geolocation provider trait and per-provider health tracking.

use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::ip::IpInfo;

/// Failures inside this window mark a provider unhealthy.
const FAILURE_WINDOW_MS: u64 = 5 * 60 * 1_000;

/// Failures within the window that mark a provider unhealthy.
const UNHEALTHY_THRESHOLD: usize = 3;

/// Failure count ceiling, so recovery never needs unbounded successes.
const FAILURE_CAP: usize = 10;

/// Consecutive successes that reset a provider to healthy.
const RECOVERY_SUCCESSES: u32 = 2;

/// A geolocation data source.
///
/// Implementations perform one lookup attempt; retries, deadlines,
/// health tracking, and fallback across providers belong to
/// [`crate::ip::IpIntelligence`].
#[async_trait]
pub trait IpProvider: Send + Sync {
    /// Provider name for logs, metrics, and events.
    fn name(&self) -> &str;

    /// Fetch information for a validated public IP.
    async fn fetch(&self, ip: IpAddr) -> Result<IpInfo>;
}

#[derive(Debug, Default)]
struct HealthInner {
    /// Failure timestamps (epoch ms), pruned to the window, capped.
    failures: Vec<u64>,
    consecutive_successes: u32,
}

/// Sliding-window health state for one provider.
#[derive(Debug, Default)]
pub struct ProviderHealth {
    inner: Mutex<HealthInner>,
}

impl ProviderHealth {
    /// Create a healthy tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the provider is currently considered healthy.
    pub fn is_healthy(&self, now_ms: u64) -> bool {
        let mut inner = self.inner.lock();
        prune(&mut inner.failures, now_ms);
        inner.failures.len() < UNHEALTHY_THRESHOLD
    }

    /// Record a failed lookup attempt.
    pub fn record_failure(&self, now_ms: u64) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        prune(&mut inner.failures, now_ms);
        if inner.failures.len() < FAILURE_CAP {
            inner.failures.push(now_ms);
        }
    }

    /// Record a successful lookup.
    ///
    /// Each success retires one outstanding failure; two in a row clear
    /// the slate entirely.
    pub fn record_success(&self, now_ms: u64) {
        let mut inner = self.inner.lock();
        prune(&mut inner.failures, now_ms);
        if !inner.failures.is_empty() {
            inner.failures.remove(0);
        }
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= RECOVERY_SUCCESSES {
            inner.failures.clear();
        }
    }
}

fn prune(failures: &mut Vec<u64>, now_ms: u64) {
    let floor = now_ms.saturating_sub(FAILURE_WINDOW_MS);
    failures.retain(|&ts| ts >= floor);
}
