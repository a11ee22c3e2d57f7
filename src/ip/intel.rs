//! Multi-provider IP lookup with health tracking, circuit breaking,
//! layered caching, and stampede control.
//!
//! Pipeline per lookup: validate the address (non-routable space never
//! touches the network), check the local TTL cache, check the
//! distributed cache when configured, then walk providers in priority
//! order under an overall deadline. Provider failures feed both a
//! sliding health window and a per-provider circuit breaker.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::clock::Clock;
use crate::error::{IpLookupError, Result};
use crate::ip::provider::{IpProvider, ProviderHealth};
use crate::ip::IpInfo;
use crate::storage::Storage;

/// Configuration for [`IpIntelligence`].
#[derive(Debug, Clone)]
pub struct IpIntelligenceConfig {
    /// Local and distributed cache TTL.
    pub cache_ttl: Duration,
    /// Budget for one whole lookup across all providers.
    pub overall_deadline: Duration,
    /// Ceiling for a single provider attempt.
    pub provider_deadline: Duration,
    /// Hard cap on provider response size (enforced by HTTP providers).
    pub max_response_bytes: usize,
    /// Key prefix for distributed cache entries.
    pub cache_key_prefix: String,
}

impl Default for IpIntelligenceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 3600),
            overall_deadline: Duration::from_secs(15),
            provider_deadline: Duration::from_secs(10),
            max_response_bytes: 1024 * 1024,
            cache_key_prefix: "guardrail:ip-cache:".to_string(),
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn IpProvider>,
    health: ProviderHealth,
    breaker: CircuitBreaker,
}

/// IP lookup service. One instance per engine; no global state.
pub struct IpIntelligence<S> {
    providers: Vec<ProviderSlot>,
    config: IpIntelligenceConfig,
    local_cache: RwLock<HashMap<IpAddr, (IpInfo, u64)>>,
    distributed_cache: Option<Arc<S>>,
    /// Per-IP fetch guards; at most one outbound fetch per IP at a time.
    in_flight: Mutex<HashMap<IpAddr, Arc<tokio::sync::Mutex<()>>>>,
    clock: Clock,
}

impl<S: Storage> IpIntelligence<S> {
    /// Create a service over the given providers, in priority order.
    pub fn new(providers: Vec<Arc<dyn IpProvider>>, config: IpIntelligenceConfig) -> Self {
        let providers = providers
            .into_iter()
            .map(|provider| {
                let breaker_name = format!("ip-provider:{}", provider.name());
                ProviderSlot {
                    provider,
                    health: ProviderHealth::new(),
                    breaker: CircuitBreaker::new(
                        breaker_name,
                        BreakerConfig {
                            call_deadline: Some(config.provider_deadline),
                            ..Default::default()
                        },
                    ),
                }
            })
            .collect();

        Self {
            providers,
            config,
            local_cache: RwLock::new(HashMap::new()),
            distributed_cache: None,
            in_flight: Mutex::new(HashMap::new()),
            clock: Clock::system(),
        }
    }

    /// Attach a distributed cache backed by the engine's storage.
    pub fn with_distributed_cache(mut self, storage: Arc<S>) -> Self {
        self.distributed_cache = Some(storage);
        self
    }

    /// Replace the time source. Tests pin a fixed clock here.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Breaker states per provider, for the `circuit_breaker_state` gauge.
    pub fn breaker_states(&self) -> Vec<(String, f64)> {
        self.providers
            .iter()
            .map(|slot| (slot.breaker.name().to_string(), slot.breaker.state().gauge()))
            .collect()
    }

    /// Look up geolocation for a raw IP string.
    ///
    /// Non-routable and unparsable addresses return an empty `IpInfo`
    /// without any I/O. Errors mean providers were configured and all
    /// of them failed; callers fall back to `IpInfo::default()`.
    pub async fn lookup(&self, raw_ip: &str) -> Result<IpInfo> {
        let Ok(addr) = super::validate_public_ip(raw_ip) else {
            return Ok(IpInfo::default());
        };

        if let Some(info) = self.local_cache_get(addr) {
            metrics::counter!("guardrail_cache_hits_total", "cache" => "ip-local").increment(1);
            return Ok(info);
        }
        metrics::counter!("guardrail_cache_misses_total", "cache" => "ip-local").increment(1);

        if let Some(info) = self.distributed_cache_get(addr).await {
            self.local_cache_put(addr, info.clone());
            return Ok(info);
        }

        if self.providers.is_empty() {
            return Ok(IpInfo::default());
        }

        // Stampede control: only one outbound fetch per IP at a time.
        let guard = self.fetch_guard(addr);
        let _held = guard.lock().await;

        // A concurrent fetch may have already filled the cache.
        if let Some(info) = self.local_cache_get(addr) {
            return Ok(info);
        }

        let fetched = self.fetch_from_providers(addr).await;
        drop(_held);
        self.release_fetch_guard(addr);

        let info = fetched?;
        self.local_cache_put(addr, info.clone());
        self.distributed_cache_put(addr, &info).await;
        Ok(info)
    }

    fn fetch_guard(&self, addr: IpAddr) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(addr)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_fetch_guard(&self, addr: IpAddr) {
        self.in_flight.lock().remove(&addr);
    }

    fn local_cache_get(&self, addr: IpAddr) -> Option<IpInfo> {
        let now = self.clock.now_ms();
        let cache = self.local_cache.read();
        cache
            .get(&addr)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(info, _)| info.clone())
    }

    fn local_cache_put(&self, addr: IpAddr, info: IpInfo) {
        let expires_at = self.clock.now_ms() + self.config.cache_ttl.as_millis() as u64;
        self.local_cache.write().insert(addr, (info, expires_at));
    }

    fn distributed_key(&self, addr: IpAddr) -> String {
        format!("{}{}", self.config.cache_key_prefix, addr)
    }

    async fn distributed_cache_get(&self, addr: IpAddr) -> Option<IpInfo> {
        let storage = self.distributed_cache.as_ref()?;
        match storage.get(&self.distributed_key(addr)).await {
            Ok(Some(raw)) => match crate::storage::parse_state_json::<IpInfo>(&raw) {
                Ok(info) => {
                    metrics::counter!("guardrail_cache_hits_total", "cache" => "ip-distributed")
                        .increment(1);
                    Some(info)
                }
                Err(e) => {
                    tracing::debug!(ip = %addr, error = %e, "discarding bad distributed cache entry");
                    None
                }
            },
            Ok(None) => {
                metrics::counter!("guardrail_cache_misses_total", "cache" => "ip-distributed")
                    .increment(1);
                None
            }
            Err(e) => {
                tracing::warn!(ip = %addr, error = %e, "distributed ip cache read failed");
                None
            }
        }
    }

    async fn distributed_cache_put(&self, addr: IpAddr, info: &IpInfo) {
        let Some(storage) = self.distributed_cache.as_ref() else {
            return;
        };
        let Ok(raw) = serde_json::to_string(info) else {
            return;
        };
        if let Err(e) = storage
            .set(&self.distributed_key(addr), &raw, Some(self.config.cache_ttl))
            .await
        {
            tracing::warn!(ip = %addr, error = %e, "distributed ip cache write failed");
        }
    }

    async fn fetch_from_providers(&self, addr: IpAddr) -> Result<IpInfo> {
        let started = Instant::now();
        let now_ms = self.clock.now_ms();

        let healthy: Vec<usize> = self
            .providers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.health.is_healthy(now_ms))
            .map(|(i, _)| i)
            .collect();

        // When every provider looks unhealthy, try all of them anyway.
        let order: Vec<usize> = if healthy.is_empty() {
            (0..self.providers.len()).collect()
        } else {
            healthy
        };

        for (attempt, &index) in order.iter().enumerate() {
            let remaining = self
                .config
                .overall_deadline
                .checked_sub(started.elapsed())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Err(IpLookupError::BudgetExhausted(self.config.overall_deadline).into());
            }

            if attempt > 0 {
                // Exponential backoff between attempts, inside the budget.
                let backoff = Duration::from_millis(
                    (100u64 << (attempt - 1).min(10)).min(2_000),
                );
                if backoff >= remaining {
                    return Err(
                        IpLookupError::BudgetExhausted(self.config.overall_deadline).into()
                    );
                }
                tokio::time::sleep(backoff).await;
            }

            let slot = &self.providers[index];
            let per_attempt = remaining.min(self.config.provider_deadline);

            let outcome = tokio::time::timeout(
                per_attempt,
                slot.breaker.execute(slot.provider.fetch(addr)),
            )
            .await;

            let now_ms = self.clock.now_ms();
            match outcome {
                Ok(Ok(info)) => {
                    slot.health.record_success(now_ms);
                    return Ok(info);
                }
                Ok(Err(e)) => {
                    slot.health.record_failure(now_ms);
                    tracing::debug!(
                        provider = slot.provider.name(),
                        error = %e,
                        "ip provider attempt failed"
                    );
                }
                Err(_) => {
                    slot.health.record_failure(now_ms);
                    tracing::debug!(
                        provider = slot.provider.name(),
                        "ip provider attempt exceeded remaining budget"
                    );
                }
            }
        }

        Err(IpLookupError::AllProvidersFailed(order.len()).into())
    }
}
