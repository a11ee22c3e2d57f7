//! Sliding-window rate limit rule.
//!
//! Admits up to `max` events per rolling `interval`, keyed by the
//! fingerprint of the configured characteristics. Prefers the storage
//! backend's atomic `sliding_window` primitive; on plain KV backends it
//! falls back to a second-granularity bucket map updated through an
//! optimistic CAS loop.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::clock::Clock;
use crate::decision::{DenyReason, RuleResult};
use crate::dynamic::DynamicValue;
use crate::error::{ConfigError, Result, RuleError};
use crate::interval::{interval_key_segment, parse_interval};
use crate::rules::{CAS_RETRY_LIMIT, Mode, RuleContext, RuleKind, default_by, validate_by};
use crate::storage::{Storage, parse_state_json};

/// Bucket granularity for the generic fallback.
const BUCKET_MS: u64 = 1_000;

/// Rolling-window rate limit configuration.
#[derive(Debug, Clone)]
pub struct SlidingWindowRule {
    /// Enforcement mode.
    pub mode: Mode,
    /// Characteristics the limit is keyed by.
    pub by: Vec<String>,
    /// Window literal (`"1m"`, `"30s"`).
    pub interval: String,
    /// Maximum admissions per window.
    pub max: DynamicValue<u64>,
    /// Fallback when a dynamic `max` fails to resolve. Without one,
    /// resolution failure is a rule error routed through the engine's
    /// error policy.
    pub fallback_max: Option<u64>,
    /// Rule-level error policy, overriding the engine default.
    pub on_error: Option<crate::config::ErrorPolicy>,
}

impl SlidingWindowRule {
    /// Create a rule admitting `max` events per `interval`.
    pub fn new(interval: impl Into<String>, max: impl Into<DynamicValue<u64>>) -> Self {
        Self {
            mode: Mode::Live,
            by: default_by(),
            interval: interval.into(),
            max: max.into(),
            fallback_max: None,
            on_error: None,
        }
    }

    /// Override the engine's error policy for this rule.
    pub fn on_error(mut self, policy: crate::config::ErrorPolicy) -> Self {
        self.on_error = Some(policy);
        self
    }

    /// Key by these characteristics instead of `ip.src`.
    pub fn by(mut self, by: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.by = by.into_iter().map(Into::into).collect();
        self
    }

    /// Switch to DRY_RUN.
    pub fn dry_run(mut self) -> Self {
        self.mode = Mode::DryRun;
        self
    }

    /// Fallback limit for failed dynamic resolution.
    pub fn with_fallback_max(mut self, fallback: u64) -> Self {
        self.fallback_max = Some(fallback);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_by(&self.by)?;
        parse_interval(&self.interval)?;
        if matches!(self.max, DynamicValue::Literal(0)) {
            return Err(ConfigError::InvalidRule("sliding window max must be positive".into()).into());
        }
        Ok(())
    }

    fn window(&self) -> Result<Duration> {
        Ok(parse_interval(&self.interval)?)
    }

    fn storage_key(&self, ctx: &RuleContext<'_>) -> Result<String> {
        let fingerprint = ctx
            .characteristics
            .fingerprint(&self.by)
            .map_err(|e| RuleError::new(RuleKind::SlidingWindow.as_str(), e.to_string()))?;
        let window = self.window()?;
        let segment = interval_key_segment(window);
        Ok(match self.max.key_discriminator() {
            Some(dyn_seg) => format!(
                "{}sliding-window:{segment}:{dyn_seg}:{fingerprint}",
                ctx.key_prefix
            ),
            None => format!("{}sliding-window:{segment}:{fingerprint}", ctx.key_prefix),
        })
    }

    async fn resolve_max(&self, ctx: &RuleContext<'_>) -> Result<u64> {
        match self.max.resolve_opt(ctx.resolve).await {
            Some(max) if max > 0 => Ok(max),
            Some(_) | None => self.fallback_max.ok_or_else(|| {
                RuleError::new(
                    RuleKind::SlidingWindow.as_str(),
                    "limit failed to resolve and no fallback is set",
                )
                .into()
            }),
        }
    }

    pub(crate) async fn evaluate<S: Storage>(
        &self,
        ctx: &RuleContext<'_>,
        storage: &S,
        clock: &Clock,
    ) -> Result<RuleResult> {
        let max = self.resolve_max(ctx).await?;
        let key = self.storage_key(ctx)?;
        let window_ms = self.window()?.as_millis() as u64;

        let outcome = if storage.capabilities().sliding_window {
            storage.sliding_window(&key, max, window_ms).await?
        } else {
            self.evaluate_generic(storage, clock, &key, max, window_ms)
                .await?
        };

        let result = if outcome.allowed {
            RuleResult::allow(RuleKind::SlidingWindow)
        } else {
            RuleResult::deny(RuleKind::SlidingWindow, DenyReason::RateLimit)
        };
        Ok(result.with_limit_info(max, outcome.remaining, outcome.reset_at))
    }

    /// Optimistic-CAS fallback over a plain KV backend.
    ///
    /// On retry exhaustion the last-read state decides the response and
    /// nothing is written: under contention we may briefly admit past
    /// `max` rather than deadlock or spin.
    async fn evaluate_generic<S: Storage>(
        &self,
        storage: &S,
        clock: &Clock,
        key: &str,
        max: u64,
        window_ms: u64,
    ) -> Result<crate::storage::AtomicOutcome> {
        let ttl = Duration::from_millis(window_ms.saturating_mul(2).max(1_000));

        for attempt in 0..=CAS_RETRY_LIMIT {
            let now = clock.now_ms();
            let raw = storage.get(key).await?;
            let mut buckets: BTreeMap<u64, u64> = match &raw {
                Some(blob) => parse_state_json(blob).unwrap_or_default(),
                None => BTreeMap::new(),
            };

            // GC buckets that fell out of the window.
            let floor = now.saturating_sub(window_ms);
            buckets.retain(|&start, _| start >= floor);

            let count: u64 = buckets.values().sum();

            if count >= max {
                // Denied: state is not updated.
                return Ok(crate::storage::AtomicOutcome {
                    allowed: false,
                    remaining: 0,
                    reset_at: now + window_ms,
                });
            }

            let last_read = count;
            if attempt == CAS_RETRY_LIMIT {
                // Retries exhausted: answer from the last read, no write.
                return Ok(crate::storage::AtomicOutcome {
                    allowed: true,
                    remaining: max - last_read - 1,
                    reset_at: buckets
                        .keys()
                        .next()
                        .map(|&oldest| oldest + window_ms)
                        .unwrap_or(now + window_ms),
                });
            }

            let bucket = now - now % BUCKET_MS;
            *buckets.entry(bucket).or_insert(0) += 1;

            let new_blob = serde_json::to_string(&buckets)
                .map_err(|e| RuleError::new(RuleKind::SlidingWindow.as_str(), e.to_string()))?;

            if storage
                .compare_and_swap(key, raw.as_deref(), &new_blob, Some(ttl))
                .await?
            {
                return Ok(crate::storage::AtomicOutcome {
                    allowed: true,
                    remaining: max - count - 1,
                    reset_at: buckets
                        .keys()
                        .next()
                        .map(|&oldest| oldest + window_ms)
                        .unwrap_or(now + window_ms),
                });
            }
            // Lost the race; reread and try again.
        }
        unreachable!("loop returns on the final attempt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristics::Characteristics;
    use crate::dynamic::ResolveContext;
    use crate::ip::IpInfo;
    use crate::request::RequestContext;
    use crate::rules::testutil::PlainKv;
    use crate::storage::MemoryStorage;

    struct Fixture {
        request: RequestContext,
        characteristics: Characteristics,
        ip: IpInfo,
        resolve: ResolveContext,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                request: RequestContext::new("POST", "/api"),
                characteristics: Characteristics::new().with("ip.src", "10.0.0.10"),
                ip: IpInfo::default(),
                resolve: ResolveContext::default(),
            }
        }

        fn ctx(&self) -> RuleContext<'_> {
            RuleContext {
                request: &self.request,
                characteristics: &self.characteristics,
                ip: &self.ip,
                resolve: &self.resolve,
                key_prefix: "guardrail:",
                requested: 1,
                email: None,
            }
        }
    }

    #[test]
    fn test_validate() {
        assert!(SlidingWindowRule::new("1m", 3u64).validate().is_ok());
        assert!(SlidingWindowRule::new("bogus", 3u64).validate().is_err());
        assert!(SlidingWindowRule::new("1m", 0u64).validate().is_err());
        assert!(
            SlidingWindowRule::new("1m", 3u64)
                .by(Vec::<String>::from([String::new()]))
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_atomic_path_admits_up_to_max() {
        let fixture = Fixture::new();
        let storage = MemoryStorage::new();
        let clock = Clock::system();
        let rule = SlidingWindowRule::new("1m", 3u64);

        for expected_remaining in [2, 1, 0] {
            let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
            assert!(!result.is_deny());
            assert_eq!(result.remaining, Some(expected_remaining));
            assert_eq!(result.limit, Some(3));
        }

        let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(result.is_deny());
        assert_eq!(result.reason, Some(DenyReason::RateLimit));
        assert_eq!(result.remaining, Some(0));
    }

    #[tokio::test]
    async fn test_generic_path_admits_up_to_max() {
        let fixture = Fixture::new();
        let clock = Clock::fixed(1_000_000);
        let storage = PlainKv(MemoryStorage::new().with_clock(clock.clone()));
        let rule = SlidingWindowRule::new("1m", 3u64);

        for expected_remaining in [2, 1, 0] {
            // Spread arrivals over distinct buckets.
            clock.advance_ms(1_500);
            let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
            assert!(!result.is_deny());
            assert_eq!(result.remaining, Some(expected_remaining));
        }

        clock.advance_ms(1_500);
        let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(result.is_deny());

        // Once the window slides past the first arrival, space opens up.
        clock.advance_ms(60_000);
        let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(!result.is_deny());
    }

    #[tokio::test]
    async fn test_deny_does_not_write_state() {
        let fixture = Fixture::new();
        let clock = Clock::fixed(1_000_000);
        let storage = PlainKv(MemoryStorage::new().with_clock(clock.clone()));
        let rule = SlidingWindowRule::new("1m", 1u64);

        rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        let key = rule.storage_key(&fixture.ctx()).unwrap();
        let blob_before = storage.get(&key).await.unwrap();

        let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(result.is_deny());
        assert_eq!(storage.get(&key).await.unwrap(), blob_before);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_do_not_share_budget() {
        let mut a = Fixture::new();
        a.characteristics = Characteristics::new().with("ip.src", "1.1.1.1");
        let mut b = Fixture::new();
        b.characteristics = Characteristics::new().with("ip.src", "2.2.2.2");

        let storage = MemoryStorage::new();
        let clock = Clock::system();
        let rule = SlidingWindowRule::new("1m", 1u64);

        assert!(!rule.evaluate(&a.ctx(), &storage, &clock).await.unwrap().is_deny());
        assert!(!rule.evaluate(&b.ctx(), &storage, &clock).await.unwrap().is_deny());
        assert!(rule.evaluate(&a.ctx(), &storage, &clock).await.unwrap().is_deny());
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_rule_error() {
        let mut fixture = Fixture::new();
        fixture.characteristics = Characteristics::new();
        let storage = MemoryStorage::new();
        let rule = SlidingWindowRule::new("1m", 3u64);

        let result = rule
            .evaluate(&fixture.ctx(), &storage, &Clock::system())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dynamic_max_from_metadata() {
        let mut fixture = Fixture::new();
        fixture
            .resolve
            .metadata
            .insert("limit".into(), serde_json::json!(2));

        let storage = MemoryStorage::new();
        let clock = Clock::system();
        let rule = SlidingWindowRule::new("1m", DynamicValue::Path("limit".into()));

        assert!(!rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
        assert!(!rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
        assert!(rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
    }

    #[tokio::test]
    async fn test_dynamic_max_unresolvable_without_fallback_errors() {
        let fixture = Fixture::new();
        let storage = MemoryStorage::new();
        let rule = SlidingWindowRule::new("1m", DynamicValue::Path("missing".into()));

        assert!(
            rule.evaluate(&fixture.ctx(), &storage, &Clock::system())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dynamic_max_fallback() {
        let fixture = Fixture::new();
        let storage = MemoryStorage::new();
        let rule = SlidingWindowRule::new("1m", DynamicValue::Path("missing".into()))
            .with_fallback_max(1);

        let clock = Clock::system();
        assert!(!rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
        assert!(rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
    }

    #[tokio::test]
    async fn test_dynamic_key_discriminator_separates_instances() {
        let fixture = Fixture::new();
        let literal = SlidingWindowRule::new("1m", 3u64);
        let dynamic = SlidingWindowRule::new("1m", DynamicValue::Path("limit".into()));

        let literal_key = literal.storage_key(&fixture.ctx()).unwrap();
        let dynamic_key = dynamic.storage_key(&fixture.ctx()).unwrap();
        assert_ne!(literal_key, dynamic_key);
        assert!(dynamic_key.contains(":limit:"));
    }
}
