//! Circuit breaker: Closed → Open → HalfOpen → Closed/Open.
//!
//! One breaker wraps each remote dependency (IP intelligence providers
//! in the core). Failures are tracked in a sliding window; when the
//! window fills, the breaker opens and `execute` rejects immediately
//! without calling the protected future. After a quiet period the first
//! call probes; enough consecutive probe successes close the breaker,
//! any probe failure re-opens it.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{BreakerError, GuardrailError, Result};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through; failures are counted.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// Probe traffic is allowed; outcomes decide the next state.
    HalfOpen,
}

impl BreakerState {
    /// Gauge value exported for this state (0 | 0.5 | 1).
    pub fn gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 0.5,
            Self::Open => 1.0,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `timeout_window` that trip the breaker.
    pub failure_threshold: usize,
    /// Sliding window over which failures are counted.
    pub timeout_window: Duration,
    /// Quiet period after the last failure before probing.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: usize,
    /// Optional per-call deadline; expiry counts as a failure.
    pub call_deadline: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            call_deadline: None,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Failure timestamps (epoch ms) within the sliding window.
    failures: Vec<u64>,
    half_open_successes: usize,
    last_failure_at: Option<u64>,
}

/// A named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Clock,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given name and configuration.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: Vec::new(),
                half_open_successes: 0,
                last_failure_at: None,
            }),
            clock: Clock::system(),
        }
    }

    /// Replace the time source. Tests pin a fixed clock here.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the Open → HalfOpen timeout transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Run `fut` through the breaker.
    ///
    /// Rejects immediately with [`BreakerError::Open`] when open. A
    /// configured call deadline races the future against a timer;
    /// expiry counts as a failure.
    pub async fn execute<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock();
            self.maybe_half_open(&mut inner);
            if inner.state == BreakerState::Open {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                }
                .into());
            }
        }

        let outcome = match self.config.call_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(GuardrailError::Breaker(BreakerError::Timeout {
                    name: self.name.clone(),
                    deadline,
                })),
            },
            None => fut.await,
        };

        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        outcome
    }

    /// Record an external success (for callers not using `execute`).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures.clear();
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.half_open_successes = 0;
                    tracing::info!(breaker = %self.name, "circuit closed after successful probes");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record an external failure (for callers not using `execute`).
    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(now);

        match inner.state {
            BreakerState::Closed => {
                let window_ms = self.config.timeout_window.as_millis() as u64;
                let floor = now.saturating_sub(window_ms);
                inner.failures.retain(|&ts| ts >= floor);
                inner.failures.push(now);

                if inner.failures.len() >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures.len(),
                        "circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.half_open_successes = 0;
                tracing::warn!(breaker = %self.name, "circuit re-opened, probe failed");
            }
            BreakerState::Open => {}
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let reset_ms = self.config.reset_timeout.as_millis() as u64;
        let quiet_since = inner.last_failure_at.unwrap_or(0);
        if self.clock.now_ms().saturating_sub(quiet_since) >= reset_ms {
            inner.state = BreakerState::HalfOpen;
            inner.half_open_successes = 0;
        }
    }
}
