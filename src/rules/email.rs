//! Email reputation rule.
//!
//! Syntactic validation plus reason-class checks against curated domain
//! tables. MX and catch-all probing is a best-effort DNS concern behind
//! the [`MxResolver`] seam; the default resolver reports "unknown", so
//! deployments wire in a real resolver only when they block on
//! `NO_MX_RECORDS` / `CATCH_ALL`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::decision::{DenyReason, RuleResult};
use crate::error::Result;
use crate::rules::{Mode, RuleContext, RuleKind};

/// Disposable-address domains.
const DISPOSABLE_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "mailinator.com",
    "guerrillamail.com",
    "guerrillamail.net",
    "yopmail.com",
    "trashmail.com",
    "getnada.com",
    "sharklasers.com",
    "dispostable.com",
    "throwaway.email",
    "temp-mail.org",
    "tempmail.dev",
    "maildrop.cc",
    "fakeinbox.com",
    "mohmal.com",
    "mintemail.com",
];

/// Free consumer providers.
const FREE_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
    "aol.com",
    "icloud.com",
    "me.com",
    "proton.me",
    "protonmail.com",
    "gmx.com",
    "gmx.net",
    "mail.com",
    "zoho.com",
    "yandex.com",
];

/// Role-account local parts.
const ROLE_LOCALS: &[&str] = &[
    "admin",
    "administrator",
    "webmaster",
    "postmaster",
    "hostmaster",
    "info",
    "contact",
    "support",
    "sales",
    "marketing",
    "billing",
    "help",
    "noreply",
    "no-reply",
    "abuse",
    "security",
    "root",
];

/// Common fat-finger spellings of big providers.
const TYPO_DOMAINS: &[&str] = &[
    "gmial.com",
    "gamil.com",
    "gmai.com",
    "gmal.com",
    "gnail.com",
    "yaho.com",
    "yahooo.com",
    "yhaoo.com",
    "hotmial.com",
    "hotmai.com",
    "hormail.com",
    "outlok.com",
    "outloook.com",
    "iclould.com",
    "icluod.com",
];

/// Why an email fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailReason {
    /// Known disposable-address provider.
    Disposable,
    /// Not a syntactically valid address.
    Invalid,
    /// Domain publishes no MX records.
    NoMxRecords,
    /// Free consumer provider.
    Free,
    /// Role account rather than a person.
    RoleBased,
    /// Domain accepts mail for any local part.
    CatchAll,
    /// Deliverability could not be determined.
    Unverifiable,
    /// Likely misspelling of a major provider.
    TypoDomain,
}

/// Outcome of an MX / catch-all probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MxStatus {
    /// MX records exist and the domain is not catch-all.
    Deliverable,
    /// No MX records published.
    NoRecords,
    /// The domain accepts any local part.
    CatchAll,
    /// The probe could not determine anything.
    Unknown,
}

/// Best-effort DNS probe seam.
#[async_trait]
pub trait MxResolver: Send + Sync {
    /// Probe MX / catch-all status for a domain.
    async fn probe(&self, domain: &str) -> Result<MxStatus>;
}

/// Default resolver: performs no I/O, reports [`MxStatus::Unknown`].
#[derive(Debug, Clone, Default)]
pub struct NoopMxResolver;

#[async_trait]
impl MxResolver for NoopMxResolver {
    async fn probe(&self, _domain: &str) -> Result<MxStatus> {
        Ok(MxStatus::Unknown)
    }
}

/// Email validation configuration.
#[derive(Clone)]
pub struct EmailRule {
    /// Enforcement mode.
    pub mode: Mode,
    /// Reasons that deny when triggered.
    pub block: Vec<EmailReason>,
    resolver: Arc<dyn MxResolver>,
}

impl std::fmt::Debug for EmailRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailRule")
            .field("mode", &self.mode)
            .field("block", &self.block)
            .finish()
    }
}

impl EmailRule {
    /// Block the given reason classes.
    pub fn new(block: impl IntoIterator<Item = EmailReason>) -> Self {
        Self {
            mode: Mode::Live,
            block: block.into_iter().collect(),
            resolver: Arc::new(NoopMxResolver),
        }
    }

    /// Wire in a real DNS resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn MxResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Switch to DRY_RUN.
    pub fn dry_run(mut self) -> Self {
        self.mode = Mode::DryRun;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.block.is_empty() {
            return Err(crate::error::ConfigError::InvalidRule(
                "email validation needs at least one blocked reason".into(),
            )
            .into());
        }
        Ok(())
    }

    pub(crate) async fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        let triggered = self.triggered_reasons(ctx.email).await;
        let denied = triggered.iter().any(|reason| self.block.contains(reason));
        if denied {
            tracing::debug!(?triggered, "email validation denied");
            RuleResult::deny(RuleKind::ValidateEmail, DenyReason::Email)
        } else {
            RuleResult::allow(RuleKind::ValidateEmail)
        }
    }

    /// All reason classes that apply to this address.
    async fn triggered_reasons(&self, email: Option<&str>) -> Vec<EmailReason> {
        let Some(email) = email.map(str::trim).filter(|e| !e.is_empty()) else {
            return vec![EmailReason::Invalid];
        };

        let Some((local, domain)) = parse_email(email) else {
            return vec![EmailReason::Invalid];
        };

        let mut reasons = Vec::new();
        let domain_lc = domain.to_ascii_lowercase();
        let local_lc = local.to_ascii_lowercase();

        if DISPOSABLE_DOMAINS.contains(&domain_lc.as_str()) {
            reasons.push(EmailReason::Disposable);
        }
        if FREE_DOMAINS.contains(&domain_lc.as_str()) {
            reasons.push(EmailReason::Free);
        }
        if TYPO_DOMAINS.contains(&domain_lc.as_str()) {
            reasons.push(EmailReason::TypoDomain);
        }
        if ROLE_LOCALS.contains(&local_lc.as_str()) {
            reasons.push(EmailReason::RoleBased);
        }

        // DNS probing only when the policy cares about its outcomes.
        let wants_probe = self.block.contains(&EmailReason::NoMxRecords)
            || self.block.contains(&EmailReason::CatchAll)
            || self.block.contains(&EmailReason::Unverifiable);
        if wants_probe {
            match self.resolver.probe(&domain_lc).await {
                Ok(MxStatus::Deliverable) => {}
                Ok(MxStatus::NoRecords) => reasons.push(EmailReason::NoMxRecords),
                Ok(MxStatus::CatchAll) => reasons.push(EmailReason::CatchAll),
                Ok(MxStatus::Unknown) => reasons.push(EmailReason::Unverifiable),
                Err(e) => {
                    tracing::debug!(domain = %domain_lc, error = %e, "mx probe failed");
                    reasons.push(EmailReason::Unverifiable);
                }
            }
        }

        reasons
    }
}

/// Split and syntactically validate an address.
fn parse_email(email: &str) -> Option<(&str, &str)> {
    if email.len() > 254 || email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    let (local, domain) = email.rsplit_once('@')?;
    if local.is_empty() || local.len() > 64 || domain.is_empty() {
        return None;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return None;
    }
    // Domain: dotted labels of [A-Za-z0-9-], no leading/trailing hyphen.
    if !domain.contains('.') || domain.len() > 253 {
        return None;
    }
    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });
    if !labels_ok {
        return None;
    }
    Some((local, domain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristics::Characteristics;
    use crate::dynamic::ResolveContext;
    use crate::ip::IpInfo;
    use crate::request::RequestContext;

    struct Fixture {
        request: RequestContext,
        characteristics: Characteristics,
        ip: IpInfo,
        resolve: ResolveContext,
        email: Option<String>,
    }

    impl Fixture {
        fn with_email(email: Option<&str>) -> Self {
            Self {
                request: RequestContext::new("POST", "/signup"),
                characteristics: Characteristics::new(),
                ip: IpInfo::default(),
                resolve: ResolveContext::default(),
                email: email.map(String::from),
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
                email: self.email.as_deref(),
            }
        }
    }

    #[test]
    fn test_parse_email() {
        assert!(parse_email("user@example.com").is_some());
        assert!(parse_email("first.last+tag@sub.example.co").is_some());
        for bad in [
            "",
            "no-at-sign",
            "@example.com",
            "user@",
            "user@nodot",
            "user name@example.com",
            "user@-bad.com",
            ".user@example.com",
            "us..er@example.com",
        ] {
            assert!(parse_email(bad).is_none(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_disposable_blocked() {
        let rule = EmailRule::new([EmailReason::Disposable, EmailReason::Invalid]);
        let fixture = Fixture::with_email(Some("user@10minutemail.com"));

        let result = rule.evaluate(&fixture.ctx()).await;
        assert!(result.is_deny());
        assert_eq!(result.reason, Some(DenyReason::Email));
    }

    #[tokio::test]
    async fn test_invalid_blocked() {
        let rule = EmailRule::new([EmailReason::Invalid]);
        for email in [Some("not-an-email"), Some(""), None] {
            let fixture = Fixture::with_email(email);
            assert!(rule.evaluate(&fixture.ctx()).await.is_deny(), "{email:?}");
        }
    }

    #[tokio::test]
    async fn test_unblocked_reasons_pass() {
        // Free provider is detected but not blocked.
        let rule = EmailRule::new([EmailReason::Disposable]);
        let fixture = Fixture::with_email(Some("user@gmail.com"));
        assert!(!rule.evaluate(&fixture.ctx()).await.is_deny());
    }

    #[tokio::test]
    async fn test_free_and_role_and_typo() {
        let rule = EmailRule::new([
            EmailReason::Free,
            EmailReason::RoleBased,
            EmailReason::TypoDomain,
        ]);

        for email in ["user@yahoo.com", "admin@company.com", "user@gmial.com"] {
            let fixture = Fixture::with_email(Some(email));
            assert!(rule.evaluate(&fixture.ctx()).await.is_deny(), "{email}");
        }

        let fixture = Fixture::with_email(Some("jane@company.com"));
        assert!(!rule.evaluate(&fixture.ctx()).await.is_deny());
    }

    #[tokio::test]
    async fn test_default_resolver_is_unverifiable() {
        // Policy blocks UNVERIFIABLE: noop resolver trips it.
        let rule = EmailRule::new([EmailReason::Unverifiable]);
        let fixture = Fixture::with_email(Some("user@company.com"));
        assert!(rule.evaluate(&fixture.ctx()).await.is_deny());

        // Policy blocks only NO_MX_RECORDS: unknown status allows.
        let rule = EmailRule::new([EmailReason::NoMxRecords]);
        assert!(!rule.evaluate(&fixture.ctx()).await.is_deny());
    }

    #[tokio::test]
    async fn test_custom_resolver() {
        struct FixedResolver(MxStatus);

        #[async_trait]
        impl MxResolver for FixedResolver {
            async fn probe(&self, _domain: &str) -> Result<MxStatus> {
                Ok(self.0)
            }
        }

        let rule = EmailRule::new([EmailReason::NoMxRecords])
            .with_resolver(Arc::new(FixedResolver(MxStatus::NoRecords)));
        let fixture = Fixture::with_email(Some("user@dead-domain.com"));
        assert!(rule.evaluate(&fixture.ctx()).await.is_deny());

        let rule = EmailRule::new([EmailReason::CatchAll])
            .with_resolver(Arc::new(FixedResolver(MxStatus::CatchAll)));
        assert!(rule.evaluate(&fixture.ctx()).await.is_deny());

        let rule = EmailRule::new([EmailReason::NoMxRecords, EmailReason::CatchAll])
            .with_resolver(Arc::new(FixedResolver(MxStatus::Deliverable)));
        assert!(!rule.evaluate(&fixture.ctx()).await.is_deny());
    }

    #[tokio::test]
    async fn test_no_probe_when_policy_does_not_need_it() {
        struct PanickingResolver;

        #[async_trait]
        impl MxResolver for PanickingResolver {
            async fn probe(&self, _domain: &str) -> Result<MxStatus> {
                panic!("probe should not run");
            }
        }

        let rule = EmailRule::new([EmailReason::Disposable])
            .with_resolver(Arc::new(PanickingResolver));
        let fixture = Fixture::with_email(Some("user@company.com"));
        assert!(!rule.evaluate(&fixture.ctx()).await.is_deny());
    }

    #[test]
    fn test_validate_rejects_empty_block() {
        assert!(EmailRule::new([]).validate().is_err());
        assert!(EmailRule::new([EmailReason::Invalid]).validate().is_ok());
    }
}
