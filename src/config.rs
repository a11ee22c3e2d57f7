//! Engine configuration and validation.
//!
//! A [`GuardrailConfig`] is validated once at engine construction;
//! anything invalid is a fatal [`crate::error::ConfigError`] there, so
//! `protect` itself never has to re-check shapes.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::presets::Preset;
use crate::rules::{Mode, Rule};
use crate::storage::validate_prefix;

/// What an internal error means for the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPolicy {
    /// Errors admit the request.
    #[default]
    FailOpen,
    /// Errors refuse the request.
    FailClosed,
}

/// How the rule pipeline is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationStrategy {
    /// Declared order, every rule runs even after a denial.
    #[default]
    Sequential,
    /// All rules run concurrently; results keep declared order.
    Parallel,
    /// Declared order, stop at the first denial.
    ShortCircuit,
}

/// Criteria for whitelist/blacklist checks.
///
/// A list matches when *any* criterion matches. Whitelist wins over
/// blacklist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListCriteria {
    /// Exact client IPs.
    pub ips: Vec<String>,
    /// Exact user ids.
    pub user_ids: Vec<String>,
    /// ISO country codes, matched against the enriched IP.
    pub countries: Vec<String>,
    /// Email domains (the part after `@`).
    pub email_domains: Vec<String>,
}

impl ListCriteria {
    /// An empty criteria set (matches nothing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Match these IPs.
    pub fn ips(mut self, ips: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ips = ips.into_iter().map(Into::into).collect();
        self
    }

    /// Match these user ids.
    pub fn user_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.user_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Match these countries.
    pub fn countries(mut self, countries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.countries = countries.into_iter().map(Into::into).collect();
        self
    }

    /// Match these email domains.
    pub fn email_domains(mut self, domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.email_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Whether any criterion matches the given request facts.
    pub(crate) fn matches(
        &self,
        ip: &str,
        user_id: Option<&str>,
        country: Option<&str>,
        email: Option<&str>,
    ) -> bool {
        if self.ips.iter().any(|candidate| candidate == ip) {
            return true;
        }
        if let Some(user_id) = user_id
            && self.user_ids.iter().any(|candidate| candidate == user_id)
        {
            return true;
        }
        if let Some(country) = country
            && self
                .countries
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(country))
        {
            return true;
        }
        if let Some(email) = email
            && let Some((_, domain)) = email.rsplit_once('@')
            && self
                .email_domains
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(domain))
        {
            return true;
        }
        false
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct GuardrailConfig {
    /// Configured rules, in evaluation order.
    pub rules: Vec<Rule>,
    /// Default characteristics for rules that don't set `by`.
    pub by: Vec<String>,
    /// Error policy when a rule (or its storage) fails.
    pub error_handling: ErrorPolicy,
    /// Pipeline strategy.
    pub evaluation_strategy: EvaluationStrategy,
    /// Requests matching these criteria skip the rules and allow.
    pub whitelist: Option<ListCriteria>,
    /// Requests matching these criteria deny with reason FILTER.
    pub blacklist: Option<ListCriteria>,
    /// Storage key prefix.
    pub key_prefix: String,
    /// Named rule preset composed beneath the explicit rules.
    pub preset: Option<Preset>,
    /// Global mode override; `Some(DryRun)` disarms every rule.
    pub mode: Option<Mode>,
    /// Optional per-rule evaluation deadline.
    pub rule_deadline: Option<std::time::Duration>,
}

impl GuardrailConfig {
    /// Start an empty configuration.
    pub fn new() -> Self {
        Self {
            key_prefix: "guardrail:".to_string(),
            ..Default::default()
        }
    }

    /// Add a rule.
    pub fn rule(mut self, rule: impl Into<Rule>) -> Self {
        self.rules.push(rule.into());
        self
    }

    /// Set the default keying characteristics.
    pub fn by(mut self, by: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.by = by.into_iter().map(Into::into).collect();
        self
    }

    /// Set the error policy.
    pub fn error_handling(mut self, policy: ErrorPolicy) -> Self {
        self.error_handling = policy;
        self
    }

    /// Set the evaluation strategy.
    pub fn evaluation_strategy(mut self, strategy: EvaluationStrategy) -> Self {
        self.evaluation_strategy = strategy;
        self
    }

    /// Set the whitelist.
    pub fn whitelist(mut self, criteria: ListCriteria) -> Self {
        self.whitelist = Some(criteria);
        self
    }

    /// Set the blacklist.
    pub fn blacklist(mut self, criteria: ListCriteria) -> Self {
        self.blacklist = Some(criteria);
        self
    }

    /// Set the storage key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Compose a preset beneath the explicit rules.
    pub fn preset(mut self, preset: Preset) -> Self {
        self.preset = Some(preset);
        self
    }

    /// Force every rule into DRY_RUN.
    pub fn dry_run(mut self) -> Self {
        self.mode = Some(Mode::DryRun);
        self
    }

    /// Bound each rule evaluation.
    pub fn rule_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.rule_deadline = Some(deadline);
        self
    }

    /// Validate the whole configuration. Fatal on failure.
    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.key_prefix)?;
        if self.by.iter().any(String::is_empty) {
            return Err(crate::error::ConfigError::InvalidRule(
                "empty characteristic key in `by`".into(),
            )
            .into());
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::SlidingWindowRule;

    #[test]
    fn test_defaults() {
        let config = GuardrailConfig::new();
        assert_eq!(config.error_handling, ErrorPolicy::FailOpen);
        assert_eq!(config.evaluation_strategy, EvaluationStrategy::Sequential);
        assert_eq!(config.key_prefix, "guardrail:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let config = GuardrailConfig::new().key_prefix("bad prefix!");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_rule() {
        let config = GuardrailConfig::new().rule(SlidingWindowRule::new("nope", 3u64));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_list_criteria_matching() {
        let criteria = ListCriteria::new()
            .ips(["10.0.0.10"])
            .user_ids(["admin-1"])
            .countries(["us"])
            .email_domains(["partner.example"]);

        assert!(criteria.matches("10.0.0.10", None, None, None));
        assert!(criteria.matches("1.1.1.1", Some("admin-1"), None, None));
        assert!(criteria.matches("1.1.1.1", None, Some("US"), None));
        assert!(criteria.matches("1.1.1.1", None, None, Some("a@partner.example")));
        assert!(criteria.matches("1.1.1.1", None, None, Some("a@PARTNER.EXAMPLE")));
        assert!(!criteria.matches("1.1.1.1", Some("other"), Some("CA"), Some("a@other.example")));
    }

    #[test]
    fn test_empty_criteria_match_nothing() {
        let criteria = ListCriteria::new();
        assert!(!criteria.matches("1.1.1.1", Some("u"), Some("US"), Some("a@b.c")));
    }
}
