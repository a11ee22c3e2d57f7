//! Named rule presets and precedence-aware composition.
//!
//! A preset is a pre-built rule list representing a policy posture.
//! Adapters carry rules as plain data at several levels (method, class,
//! module) on top of a preset; composition resolves per-kind conflicts
//! by source precedence: method > class > module > preset. An explicit
//! preset replaces any previously composed preset rather than adding to
//! it.

use serde::{Deserialize, Serialize};

use crate::rules::{
    AttackCategory, BotRule, EmailReason, EmailRule, Rule, RuleKind, ShieldRule,
    SlidingWindowRule, TokenBucketRule,
};

/// Pre-built rule lists for common policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// General API surface: shield plus a moderate rate limit.
    Api,
    /// Browser-facing pages: shield, bot blocking, lighter limit.
    Web,
    /// Lock everything down hard.
    Strict,
    /// LLM/inference endpoints: token-bucket quotas per user.
    Ai,
    /// Payment endpoints: strict limits, shield, no bots.
    Payment,
    /// Login/signup: brute-force limits and email validation.
    Auth,
    /// Local development: everything in DRY_RUN.
    Development,
}

impl Preset {
    /// The preset's rule list.
    pub fn rules(&self) -> Vec<Rule> {
        match self {
            Self::Api => vec![
                ShieldRule::new().into(),
                SlidingWindowRule::new("1m", 120u64).into(),
            ],
            Self::Web => vec![
                ShieldRule::new().into(),
                BotRule::new()
                    .allow(["googlebot", "bingbot", "duckduckbot"])
                    .into(),
                SlidingWindowRule::new("1m", 300u64).into(),
            ],
            Self::Strict => vec![
                ShieldRule::new().into(),
                BotRule::new().allow(Vec::<String>::new()).into(),
                SlidingWindowRule::new("1m", 30u64).into(),
            ],
            Self::Ai => vec![
                ShieldRule::new().into(),
                TokenBucketRule::new("1h", 100_000u64, 20_000u64)
                    .by(["userId"])
                    .into(),
            ],
            Self::Payment => vec![
                ShieldRule::new().into(),
                BotRule::new().allow(Vec::<String>::new()).into(),
                SlidingWindowRule::new("1m", 10u64).into(),
            ],
            Self::Auth => vec![
                ShieldRule::new()
                    .categories([
                        AttackCategory::SqlInjection,
                        AttackCategory::Xss,
                        AttackCategory::CommandInjection,
                        AttackCategory::Anomaly,
                    ])
                    .into(),
                SlidingWindowRule::new("1m", 5u64).into(),
                EmailRule::new([EmailReason::Disposable, EmailReason::Invalid]).into(),
            ],
            Self::Development => vec![
                ShieldRule::new().dry_run().into(),
                SlidingWindowRule::new("1m", 1_000u64).dry_run().into(),
            ],
        }
    }
}

/// Compose rule layers by precedence.
///
/// Higher-precedence layers come first in the arguments; within the
/// result, the first rule of each kind wins and lower layers only
/// contribute kinds not yet present. The preset is the lowest layer.
pub fn compose_rules(layers: &[&[Rule]], preset: Option<Preset>) -> Vec<Rule> {
    let mut seen: Vec<RuleKind> = Vec::new();
    let mut composed: Vec<Rule> = Vec::new();

    let preset_rules = preset.map(|p| p.rules()).unwrap_or_default();
    let all_layers = layers.iter().copied().chain(std::iter::once(&preset_rules[..]));

    for layer in all_layers {
        for rule in layer {
            if !seen.contains(&rule.kind()) {
                seen.push(rule.kind());
                composed.push(rule.clone());
            }
        }
    }
    composed
}
