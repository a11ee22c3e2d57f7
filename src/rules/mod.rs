//! Admission rules.
//!
//! A rule is a tagged variant with one evaluator per kind: no dynamic
//! dispatch on the hot path, and parallel evaluation stays trivial. Each
//! evaluator receives the request context, the storage backend, and the
//! clock, and returns a [`RuleResult`].

mod bot;
mod email;
mod filter;
mod shield;
mod sliding_window;
mod token_bucket;

pub use bot::BotRule;
pub use email::{EmailReason, EmailRule, MxResolver, MxStatus, NoopMxResolver};
pub use filter::FilterRule;
pub use shield::{AttackCategory, ShieldRule};
pub use sliding_window::SlidingWindowRule;
pub use token_bucket::TokenBucketRule;

use serde::{Deserialize, Serialize};

use crate::characteristics::Characteristics;
use crate::clock::Clock;
use crate::decision::RuleResult;
use crate::dynamic::ResolveContext;
use crate::error::{ConfigError, Result};
use crate::ip::IpInfo;
use crate::request::RequestContext;
use crate::storage::Storage;

/// Ceiling on optimistic-CAS retries in the generic storage fallback.
pub(crate) const CAS_RETRY_LIMIT: usize = 5;

/// Per-rule enforcement switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Enforce: denials deny.
    #[default]
    Live,
    /// Evaluate and report, but never deny.
    DryRun,
}

/// Discriminant for the six rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Rolling-window rate limit.
    SlidingWindow,
    /// Token-bucket quota.
    TokenBucket,
    /// Payload attack scanner.
    Shield,
    /// User-agent bot policy.
    DetectBot,
    /// Email reputation check.
    ValidateEmail,
    /// Declarative expression filter.
    Filter,
}

impl RuleKind {
    /// Label used in storage keys, events, and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlidingWindow => "sliding-window",
            Self::TokenBucket => "token-bucket",
            Self::Shield => "shield",
            Self::DetectBot => "detect-bot",
            Self::ValidateEmail => "validate-email",
            Self::Filter => "filter",
        }
    }
}

/// Everything an evaluator may consult, borrowed per request.
pub struct RuleContext<'a> {
    /// The inbound request.
    pub request: &'a RequestContext,
    /// Extracted characteristics.
    pub characteristics: &'a Characteristics,
    /// Enriched IP information.
    pub ip: &'a IpInfo,
    /// Context for dynamic limit resolution.
    pub resolve: &'a ResolveContext,
    /// Storage key prefix.
    pub key_prefix: &'a str,
    /// Tokens requested from token buckets (default 1).
    pub requested: u64,
    /// Email under validation, when supplied.
    pub email: Option<&'a str>,
}

/// A configured admission rule.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Rolling-window rate limit.
    SlidingWindow(SlidingWindowRule),
    /// Token-bucket quota.
    TokenBucket(TokenBucketRule),
    /// Payload attack scanner.
    Shield(ShieldRule),
    /// User-agent bot policy.
    DetectBot(BotRule),
    /// Email reputation check.
    ValidateEmail(EmailRule),
    /// Declarative expression filter.
    Filter(FilterRule),
}

impl From<SlidingWindowRule> for Rule {
    fn from(rule: SlidingWindowRule) -> Self {
        Self::SlidingWindow(rule)
    }
}

impl From<TokenBucketRule> for Rule {
    fn from(rule: TokenBucketRule) -> Self {
        Self::TokenBucket(rule)
    }
}

impl From<ShieldRule> for Rule {
    fn from(rule: ShieldRule) -> Self {
        Self::Shield(rule)
    }
}

impl From<BotRule> for Rule {
    fn from(rule: BotRule) -> Self {
        Self::DetectBot(rule)
    }
}

impl From<EmailRule> for Rule {
    fn from(rule: EmailRule) -> Self {
        Self::ValidateEmail(rule)
    }
}

impl From<FilterRule> for Rule {
    fn from(rule: FilterRule) -> Self {
        Self::Filter(rule)
    }
}

impl Rule {
    /// The rule's kind discriminant.
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::SlidingWindow(_) => RuleKind::SlidingWindow,
            Self::TokenBucket(_) => RuleKind::TokenBucket,
            Self::Shield(_) => RuleKind::Shield,
            Self::DetectBot(_) => RuleKind::DetectBot,
            Self::ValidateEmail(_) => RuleKind::ValidateEmail,
            Self::Filter(_) => RuleKind::Filter,
        }
    }

    /// The rule's enforcement mode.
    pub fn mode(&self) -> Mode {
        match self {
            Self::SlidingWindow(r) => r.mode,
            Self::TokenBucket(r) => r.mode,
            Self::Shield(r) => r.mode,
            Self::DetectBot(r) => r.mode,
            Self::ValidateEmail(r) => r.mode,
            Self::Filter(r) => r.mode,
        }
    }

    /// Rule-level error policy override, if any.
    pub fn error_policy(&self) -> Option<crate::config::ErrorPolicy> {
        match self {
            Self::SlidingWindow(r) => r.on_error,
            Self::TokenBucket(r) => r.on_error,
            _ => None,
        }
    }

    /// The reason a fail-closed denial of this rule carries.
    pub fn canonical_reason(&self) -> crate::decision::DenyReason {
        use crate::decision::DenyReason;
        match self.kind() {
            RuleKind::SlidingWindow => DenyReason::RateLimit,
            RuleKind::TokenBucket => DenyReason::Quota,
            RuleKind::Shield => DenyReason::Shield,
            RuleKind::DetectBot => DenyReason::Bot,
            RuleKind::ValidateEmail => DenyReason::Email,
            RuleKind::Filter => DenyReason::Filter,
        }
    }

    /// Validate the rule's shape. Called once at engine construction.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SlidingWindow(r) => r.validate(),
            Self::TokenBucket(r) => r.validate(),
            Self::Shield(r) => r.validate(),
            Self::DetectBot(r) => r.validate(),
            Self::ValidateEmail(r) => r.validate(),
            Self::Filter(r) => r.validate(),
        }
    }

    /// Evaluate the rule.
    ///
    /// The computed result is returned as-is in LIVE mode; DRY_RUN
    /// rewrites the conclusion to ALLOW while keeping the computed
    /// remaining/limit/reset fields.
    pub async fn evaluate<S: Storage>(
        &self,
        ctx: &RuleContext<'_>,
        storage: &S,
        clock: &Clock,
    ) -> Result<RuleResult> {
        let result = match self {
            Self::SlidingWindow(r) => r.evaluate(ctx, storage, clock).await?,
            Self::TokenBucket(r) => r.evaluate(ctx, storage, clock).await?,
            Self::Shield(r) => r.evaluate(ctx),
            Self::DetectBot(r) => r.evaluate(ctx),
            Self::ValidateEmail(r) => r.evaluate(ctx).await,
            Self::Filter(r) => r.evaluate(ctx),
        };

        Ok(match self.mode() {
            Mode::Live => result,
            Mode::DryRun => result.into_dry_run(),
        })
    }
}

/// Default keying when a rule names no characteristics.
pub(crate) fn default_by() -> Vec<String> {
    vec!["ip.src".to_string()]
}

/// Validate a `by` list: empty entries are configuration mistakes.
pub(crate) fn validate_by(by: &[String]) -> Result<()> {
    if by.iter().any(String::is_empty) {
        return Err(ConfigError::InvalidRule("empty characteristic key in `by`".into()).into());
    }
    Ok(())
}
