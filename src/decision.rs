//! Decision types for admission results.
//!
//! Each call to [`crate::Guardrail::protect`] produces a [`Decision`]:
//! the overall conclusion, the per-rule results in declared order, the
//! enriched IP information, and snapshots of the characteristics and
//! metadata the rules evaluated against. Decisions are immutable after
//! assembly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::characteristics::Characteristics;
use crate::ip::IpInfo;
use crate::rules::RuleKind;

/// Whether a request is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conclusion {
    /// Request admitted.
    Allow,
    /// Request refused.
    Deny,
}

impl Conclusion {
    /// Label used in events and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
        }
    }
}

/// Why a rule denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    /// A sliding-window limit was exceeded.
    RateLimit,
    /// A token-bucket quota was exhausted.
    Quota,
    /// The user agent matched the bot policy.
    Bot,
    /// The email failed validation.
    Email,
    /// The payload matched an attack pattern.
    Shield,
    /// A filter expression (or blacklist entry) matched.
    Filter,
}

impl DenyReason {
    /// Label used in events and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "RATE_LIMIT",
            Self::Quota => "QUOTA",
            Self::Bot => "BOT",
            Self::Email => "EMAIL",
            Self::Shield => "SHIELD",
            Self::Filter => "FILTER",
        }
    }

    /// Fixed, non-leaking message for DENY payloads.
    pub fn message(&self) -> &'static str {
        match self {
            Self::RateLimit => "Too many requests",
            Self::Quota => "Quota exhausted",
            Self::Bot => "Automated traffic refused",
            Self::Email => "Email address rejected",
            Self::Shield => "Request blocked",
            Self::Filter => "Request does not match access policy",
        }
    }
}

/// The outcome of evaluating a single rule.
///
/// Invariants: `reason` is present iff `conclusion` is `Deny`;
/// `remaining` never underflows; `reset_at` is absolute epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResult {
    /// Which rule produced this result.
    pub kind: RuleKind,
    /// The rule's conclusion.
    pub conclusion: Conclusion,
    /// Deny reason; present iff denied.
    pub reason: Option<DenyReason>,
    /// Remaining budget, for rate-limit style rules.
    pub remaining: Option<u64>,
    /// Configured limit, for rate-limit style rules.
    pub limit: Option<u64>,
    /// When the limit resets (epoch milliseconds).
    pub reset_at: Option<u64>,
    /// Error kind recorded when the rule failed and policy said fail-open.
    pub error: Option<String>,
}

impl RuleResult {
    /// An allowing result.
    pub fn allow(kind: RuleKind) -> Self {
        Self {
            kind,
            conclusion: Conclusion::Allow,
            reason: None,
            remaining: None,
            limit: None,
            reset_at: None,
            error: None,
        }
    }

    /// A denying result with the given reason.
    pub fn deny(kind: RuleKind, reason: DenyReason) -> Self {
        Self {
            kind,
            conclusion: Conclusion::Deny,
            reason: Some(reason),
            remaining: None,
            limit: None,
            reset_at: None,
            error: None,
        }
    }

    /// A result recording an internal failure under fail-open policy.
    pub fn errored(kind: RuleKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            conclusion: Conclusion::Allow,
            reason: None,
            remaining: None,
            limit: None,
            reset_at: None,
            error: Some(error.into()),
        }
    }

    /// Attach rate-limit bookkeeping.
    pub fn with_limit_info(mut self, limit: u64, remaining: u64, reset_at: u64) -> Self {
        self.limit = Some(limit);
        self.remaining = Some(remaining);
        self.reset_at = Some(reset_at);
        self
    }

    /// Whether this result denies the request.
    pub fn is_deny(&self) -> bool {
        self.conclusion == Conclusion::Deny
    }

    /// Rewrite a denial into an allow, preserving the computed
    /// remaining/limit/reset fields. Used by DRY_RUN rules.
    pub fn into_dry_run(mut self) -> Self {
        self.conclusion = Conclusion::Allow;
        self
    }
}

/// View over the first denying result of a decision.
///
/// Answers `false`/`None` to everything when the decision allowed the
/// request, so adapters can call it unconditionally.
#[derive(Debug, Clone, Copy)]
pub struct ReasonView<'a> {
    denying: Option<&'a RuleResult>,
}

impl<'a> ReasonView<'a> {
    fn matches(&self, reason: DenyReason) -> bool {
        self.denying.and_then(|r| r.reason) == Some(reason)
    }

    /// Denied by a sliding-window rate limit.
    pub fn is_rate_limit(&self) -> bool {
        self.matches(DenyReason::RateLimit)
    }

    /// Denied by a token-bucket quota.
    pub fn is_quota(&self) -> bool {
        self.matches(DenyReason::Quota)
    }

    /// Denied by bot detection.
    pub fn is_bot(&self) -> bool {
        self.matches(DenyReason::Bot)
    }

    /// Denied by email validation.
    pub fn is_email(&self) -> bool {
        self.matches(DenyReason::Email)
    }

    /// Denied by the payload scanner.
    pub fn is_shield(&self) -> bool {
        self.matches(DenyReason::Shield)
    }

    /// Denied by a filter expression or list entry.
    pub fn is_filter(&self) -> bool {
        self.matches(DenyReason::Filter)
    }

    /// Remaining budget reported by the denying rule.
    pub fn remaining(&self) -> Option<u64> {
        self.denying.and_then(|r| r.remaining)
    }

    /// The denying reason, if any.
    pub fn reason(&self) -> Option<DenyReason> {
        self.denying.and_then(|r| r.reason)
    }

    /// Fixed user-facing message for the denial.
    pub fn message(&self) -> Option<&'static str> {
        self.reason().map(|r| r.message())
    }
}

/// The result of one `protect` invocation.
#[derive(Debug, Clone)]
pub struct Decision {
    id: String,
    conclusion: Conclusion,
    results: Vec<RuleResult>,
    ip: IpInfo,
    characteristics: Characteristics,
    metadata: BTreeMap<String, Value>,
}

impl Decision {
    /// Assemble a decision from recorded rule results.
    ///
    /// The conclusion is `Deny` iff any recorded result denies.
    pub(crate) fn assemble(
        id: String,
        results: Vec<RuleResult>,
        ip: IpInfo,
        characteristics: Characteristics,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        let conclusion = if results.iter().any(RuleResult::is_deny) {
            Conclusion::Deny
        } else {
            Conclusion::Allow
        };
        Self {
            id,
            conclusion,
            results,
            ip,
            characteristics,
            metadata,
        }
    }

    /// Unique id for this invocation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The overall conclusion.
    pub fn conclusion(&self) -> Conclusion {
        self.conclusion
    }

    /// Check if the request is allowed.
    pub fn is_allowed(&self) -> bool {
        self.conclusion == Conclusion::Allow
    }

    /// Check if the request is denied.
    pub fn is_denied(&self) -> bool {
        self.conclusion == Conclusion::Deny
    }

    /// View over the first denying result, in declared rule order.
    pub fn reason(&self) -> ReasonView<'_> {
        ReasonView {
            denying: self.results.iter().find(|r| r.is_deny()),
        }
    }

    /// Per-rule results in declared order.
    pub fn results(&self) -> &[RuleResult] {
        &self.results
    }

    /// Enriched IP information.
    pub fn ip(&self) -> &IpInfo {
        &self.ip
    }

    /// Snapshot of the characteristics the rules evaluated against.
    pub fn characteristics(&self) -> &Characteristics {
        &self.characteristics
    }

    /// Snapshot of the caller-supplied metadata.
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// First rate-limit style result (sliding window or token bucket),
    /// used for `X-RateLimit-*` response headers.
    pub fn rate_limit_result(&self) -> Option<&RuleResult> {
        self.results
            .iter()
            .find(|r| matches!(r.kind, RuleKind::SlidingWindow | RuleKind::TokenBucket))
    }

    /// Human-readable explanation of the decision, one line per rule.
    pub fn explain(&self) -> String {
        let mut out = format!("decision {} {}", self.id, self.conclusion.as_str());
        for r in &self.results {
            out.push('\n');
            out.push_str(&format!("  {} {}", r.kind.as_str(), r.conclusion.as_str()));
            if let Some(reason) = r.reason {
                out.push_str(&format!(" reason={}", reason.as_str()));
            }
            if let (Some(remaining), Some(limit)) = (r.remaining, r.limit) {
                out.push_str(&format!(" {remaining}/{limit}"));
            }
            if let Some(err) = &r.error {
                out.push_str(&format!(" error={err}"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(results: Vec<RuleResult>) -> Decision {
        Decision::assemble(
            "test-id".into(),
            results,
            IpInfo::default(),
            Characteristics::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_all_allow() {
        let d = assemble(vec![
            RuleResult::allow(RuleKind::SlidingWindow),
            RuleResult::allow(RuleKind::DetectBot),
        ]);
        assert!(d.is_allowed());
        assert!(!d.is_denied());
        assert!(!d.reason().is_rate_limit());
        assert_eq!(d.reason().reason(), None);
    }

    #[test]
    fn test_first_deny_wins() {
        let d = assemble(vec![
            RuleResult::allow(RuleKind::DetectBot),
            RuleResult::deny(RuleKind::SlidingWindow, DenyReason::RateLimit)
                .with_limit_info(3, 0, 1_700_000_000_000),
            RuleResult::deny(RuleKind::Filter, DenyReason::Filter),
        ]);
        assert!(d.is_denied());
        assert!(d.reason().is_rate_limit());
        assert!(!d.reason().is_filter());
        assert_eq!(d.reason().remaining(), Some(0));
    }

    #[test]
    fn test_dry_run_rewrite_preserves_info() {
        let result = RuleResult::deny(RuleKind::SlidingWindow, DenyReason::RateLimit)
            .with_limit_info(1, 0, 42)
            .into_dry_run();
        assert_eq!(result.conclusion, Conclusion::Allow);
        assert_eq!(result.remaining, Some(0));
        assert_eq!(result.reset_at, Some(42));

        let d = assemble(vec![result]);
        assert!(d.is_allowed());
    }

    #[test]
    fn test_explain_contains_rules() {
        let d = assemble(vec![RuleResult::deny(RuleKind::Shield, DenyReason::Shield)]);
        let text = d.explain();
        assert!(text.contains("shield"));
        assert!(text.contains("SHIELD"));
    }

    #[test]
    fn test_fixed_messages_do_not_leak() {
        assert_eq!(DenyReason::Shield.message(), "Request blocked");
        assert_eq!(DenyReason::RateLimit.message(), "Too many requests");
    }
}
