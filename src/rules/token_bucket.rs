//! Token-bucket quota rule.
//!
//! A bucket holds up to `capacity` tokens and gains `refill_rate` tokens
//! per whole elapsed `interval`. A fraction of an interval refills
//! nothing, and the refill clock keeps phase so buckets never drift.
//! Each call consumes `requested` tokens (default 1). Prefers the
//! storage backend's atomic `token_bucket` primitive; plain KV backends
//! get an optimistic CAS loop over the same state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::decision::{DenyReason, RuleResult};
use crate::dynamic::DynamicValue;
use crate::error::{ConfigError, Result, RuleError};
use crate::interval::{interval_key_segment, parse_interval};
use crate::rules::{CAS_RETRY_LIMIT, Mode, RuleContext, RuleKind, default_by, validate_by};
use crate::storage::{AtomicOutcome, Storage, parse_state_json};

/// Bucket state for the generic fallback path.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
}

/// Token-bucket quota configuration.
#[derive(Debug, Clone)]
pub struct TokenBucketRule {
    /// Enforcement mode.
    pub mode: Mode,
    /// Characteristics the bucket is keyed by.
    pub by: Vec<String>,
    /// Refill interval literal.
    pub interval: String,
    /// Maximum tokens the bucket holds.
    pub capacity: DynamicValue<u64>,
    /// Tokens added per interval.
    pub refill_rate: DynamicValue<u64>,
    /// Fallback when a dynamic `capacity` fails to resolve.
    pub fallback_capacity: Option<u64>,
    /// Rule-level error policy, overriding the engine default.
    pub on_error: Option<crate::config::ErrorPolicy>,
}

impl TokenBucketRule {
    /// Create a bucket of `capacity` refilling `refill_rate` per
    /// `interval`.
    pub fn new(
        interval: impl Into<String>,
        capacity: impl Into<DynamicValue<u64>>,
        refill_rate: impl Into<DynamicValue<u64>>,
    ) -> Self {
        Self {
            mode: Mode::Live,
            by: default_by(),
            interval: interval.into(),
            capacity: capacity.into(),
            refill_rate: refill_rate.into(),
            fallback_capacity: None,
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

    /// Fallback capacity for failed dynamic resolution.
    pub fn with_fallback_capacity(mut self, fallback: u64) -> Self {
        self.fallback_capacity = Some(fallback);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_by(&self.by)?;
        parse_interval(&self.interval)?;
        if matches!(self.capacity, DynamicValue::Literal(0)) {
            return Err(ConfigError::InvalidRule("token bucket capacity must be positive".into()).into());
        }
        if matches!(self.refill_rate, DynamicValue::Literal(0)) {
            return Err(
                ConfigError::InvalidRule("token bucket refill rate must be positive".into()).into(),
            );
        }
        Ok(())
    }

    fn storage_key(&self, ctx: &RuleContext<'_>) -> Result<String> {
        let fingerprint = ctx
            .characteristics
            .fingerprint(&self.by)
            .map_err(|e| RuleError::new(RuleKind::TokenBucket.as_str(), e.to_string()))?;
        let segment = interval_key_segment(parse_interval(&self.interval)?);
        Ok(match self.capacity.key_discriminator() {
            Some(dyn_seg) => format!(
                "{}token-bucket:{segment}:{dyn_seg}:{fingerprint}",
                ctx.key_prefix
            ),
            None => format!("{}token-bucket:{segment}:{fingerprint}", ctx.key_prefix),
        })
    }

    pub(crate) async fn evaluate<S: Storage>(
        &self,
        ctx: &RuleContext<'_>,
        storage: &S,
        clock: &Clock,
    ) -> Result<RuleResult> {
        let capacity = match self.capacity.resolve_opt(ctx.resolve).await {
            Some(c) if c > 0 => c,
            Some(_) | None => self.fallback_capacity.ok_or_else(|| {
                RuleError::new(
                    RuleKind::TokenBucket.as_str(),
                    "capacity failed to resolve and no fallback is set",
                )
            })?,
        };
        let refill_rate = self.refill_rate.resolve(ctx.resolve, capacity).await.max(1);
        let interval_ms = parse_interval(&self.interval)?.as_millis() as u64;
        let requested = ctx.requested.max(1);
        let key = self.storage_key(ctx)?;

        let outcome = if storage.capabilities().token_bucket {
            storage
                .token_bucket(&key, capacity, refill_rate, interval_ms, requested)
                .await?
        } else {
            self.evaluate_generic(storage, clock, &key, capacity, refill_rate, interval_ms, requested)
                .await?
        };

        let result = if outcome.allowed {
            RuleResult::allow(RuleKind::TokenBucket)
        } else {
            RuleResult::deny(RuleKind::TokenBucket, DenyReason::Quota)
        };
        Ok(result.with_limit_info(capacity, outcome.remaining, outcome.reset_at))
    }

    /// Optimistic-CAS fallback over a plain KV backend.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_generic<S: Storage>(
        &self,
        storage: &S,
        clock: &Clock,
        key: &str,
        capacity: u64,
        refill_rate: u64,
        interval_ms: u64,
        requested: u64,
    ) -> Result<AtomicOutcome> {
        let ttl = Duration::from_millis(interval_ms.saturating_mul(10).max(1_000));

        for attempt in 0..=CAS_RETRY_LIMIT {
            let now = clock.now_ms();
            let raw = storage.get(key).await?;
            let mut state = match &raw {
                Some(blob) => parse_state_json::<BucketState>(blob).unwrap_or(BucketState {
                    tokens: capacity as f64,
                    last_refill: now,
                }),
                None => BucketState {
                    tokens: capacity as f64,
                    last_refill: now,
                },
            };

            // Whole elapsed intervals only; last_refill keeps phase.
            if now > state.last_refill && interval_ms > 0 {
                let periods = (now - state.last_refill) / interval_ms;
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

            let outcome = AtomicOutcome {
                allowed,
                remaining: state.tokens.floor().max(0.0) as u64,
                reset_at: reset_at(&state, capacity, refill_rate, interval_ms),
            };

            if attempt == CAS_RETRY_LIMIT {
                // Retries exhausted: answer from the last read, no write.
                return Ok(outcome);
            }

            let new_blob = serde_json::to_string(&state)
                .map_err(|e| RuleError::new(RuleKind::TokenBucket.as_str(), e.to_string()))?;
            if storage
                .compare_and_swap(key, raw.as_deref(), &new_blob, Some(ttl))
                .await?
            {
                return Ok(outcome);
            }
        }
        unreachable!("loop returns on the final attempt");
    }
}

/// When the bucket is full again.
fn reset_at(state: &BucketState, capacity: u64, refill_rate: u64, interval_ms: u64) -> u64 {
    let deficit = capacity as f64 - state.tokens;
    if deficit <= 0.0 || refill_rate == 0 {
        return state.last_refill;
    }
    let periods = (deficit / refill_rate as f64).ceil() as u64;
    state.last_refill + periods * interval_ms
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
        requested: u64,
    }

    impl Fixture {
        fn user(requested: u64) -> Self {
            Self {
                request: RequestContext::new("POST", "/api"),
                characteristics: Characteristics::new().with("userId", "user1"),
                ip: IpInfo::default(),
                resolve: ResolveContext::default(),
                requested,
            }
        }

        fn ctx(&self) -> RuleContext<'_> {
            RuleContext {
                request: &self.request,
                characteristics: &self.characteristics,
                ip: &self.ip,
                resolve: &self.resolve,
                key_prefix: "guardrail:",
                requested: self.requested,
                email: None,
            }
        }
    }

    fn user_rule() -> TokenBucketRule {
        TokenBucketRule::new("1h", 5_000u64, 1_000u64).by(["userId"])
    }

    #[test]
    fn test_validate() {
        assert!(user_rule().validate().is_ok());
        assert!(TokenBucketRule::new("x", 5u64, 1u64).validate().is_err());
        assert!(TokenBucketRule::new("1h", 0u64, 1u64).validate().is_err());
        assert!(TokenBucketRule::new("1h", 5u64, 0u64).validate().is_err());
    }

    #[tokio::test]
    async fn test_quota_consumption_atomic() {
        let fixture = Fixture::user(2_000);
        let storage = MemoryStorage::new();
        let clock = Clock::system();
        let rule = user_rule();

        let r1 = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(!r1.is_deny());
        assert_eq!(r1.remaining, Some(3_000));

        let r2 = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(!r2.is_deny());
        assert_eq!(r2.remaining, Some(1_000));

        let r3 = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(r3.is_deny());
        assert_eq!(r3.reason, Some(DenyReason::Quota));
        assert_eq!(r3.remaining, Some(1_000));
    }

    #[tokio::test]
    async fn test_quota_consumption_generic() {
        let fixture = Fixture::user(2_000);
        let clock = Clock::fixed(1_000_000);
        let storage = PlainKv(MemoryStorage::new().with_clock(clock.clone()));
        let rule = user_rule();

        assert!(!rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
        assert!(!rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
        let denied = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(denied.is_deny());
        assert_eq!(denied.remaining, Some(1_000));
    }

    #[tokio::test]
    async fn test_discrete_refill_preserves_phase() {
        let fixture = Fixture::user(1);
        let clock = Clock::fixed(0);
        let storage = PlainKv(MemoryStorage::new().with_clock(clock.clone()));
        let rule = TokenBucketRule::new("10s", 2u64, 1u64).by(["userId"]);

        // Drain the bucket.
        rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert!(rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());

        // 9.9s: no refill yet.
        clock.advance_ms(9_900);
        assert!(rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());

        // Crossing the interval boundary refills exactly one token, and
        // the phase stays anchored to the original refill time.
        clock.advance_ms(100);
        assert!(!rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
        assert!(rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());

        clock.advance_ms(10_000);
        assert!(!rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap().is_deny());
    }

    #[tokio::test]
    async fn test_tokens_capped_at_capacity() {
        let fixture = Fixture::user(1);
        let clock = Clock::fixed(0);
        let storage = PlainKv(MemoryStorage::new().with_clock(clock.clone()));
        let rule = TokenBucketRule::new("1s", 3u64, 3u64).by(["userId"]);

        rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        // A long idle period cannot overfill the bucket.
        clock.advance_ms(3_600_000);
        let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert_eq!(result.remaining, Some(2));
    }

    #[tokio::test]
    async fn test_dynamic_capacity_discriminator_in_key() {
        let fixture = Fixture::user(1);
        let rule = TokenBucketRule::new("1h", DynamicValue::Path("plan.limit".into()), 100u64)
            .by(["userId"]);
        let key = rule.storage_key(&fixture.ctx()).unwrap();
        assert!(key.contains("token-bucket:3600:plan.limit:"));
    }

    #[tokio::test]
    async fn test_requested_defaults_to_one() {
        let fixture = Fixture::user(0);
        let storage = MemoryStorage::new();
        let clock = Clock::system();
        let rule = TokenBucketRule::new("1h", 2u64, 1u64).by(["userId"]);

        let result = rule.evaluate(&fixture.ctx(), &storage, &clock).await.unwrap();
        assert_eq!(result.remaining, Some(1));
    }
}
