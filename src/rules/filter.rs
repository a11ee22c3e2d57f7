//! Declarative filter rule over the expression language.
//!
//! Two expression lists: `deny` wins first, then a non-empty `allow`
//! list requires at least one match. Expressions bind against a
//! flattened view of the characteristics, the enriched IP fields, and
//! the request surface.

use std::sync::{Arc, OnceLock};

use crate::decision::{DenyReason, RuleResult};
use crate::error::Result;
use crate::expr::{CompiledExpr, ExprContext};
use crate::rules::{Mode, RuleContext, RuleKind};

/// Filter configuration.
#[derive(Debug, Clone, Default)]
pub struct FilterRule {
    /// Enforcement mode.
    pub mode: Mode,
    /// Any truthy expression denies.
    pub deny: Vec<String>,
    /// When non-empty, at least one expression must be truthy.
    pub allow: Vec<String>,
    compiled: Arc<OnceLock<CompiledLists>>,
}

#[derive(Debug)]
struct CompiledLists {
    deny: Vec<CompiledExpr>,
    allow: Vec<CompiledExpr>,
}

impl FilterRule {
    /// Create an empty filter (allows everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny when any of these expressions is truthy.
    pub fn deny(mut self, exprs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.deny = exprs.into_iter().map(Into::into).collect();
        self.compiled = Arc::new(OnceLock::new());
        self
    }

    /// Require at least one of these expressions to be truthy.
    pub fn allow(mut self, exprs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow = exprs.into_iter().map(Into::into).collect();
        self.compiled = Arc::new(OnceLock::new());
        self
    }

    /// Switch to DRY_RUN.
    pub fn dry_run(mut self) -> Self {
        self.mode = Mode::DryRun;
        self
    }

    /// Compile every expression; surfaces bad sources at construction.
    pub(crate) fn validate(&self) -> Result<()> {
        for source in self.deny.iter().chain(&self.allow) {
            CompiledExpr::compile(source)?;
        }
        Ok(())
    }

    fn lists(&self) -> &CompiledLists {
        self.compiled.get_or_init(|| CompiledLists {
            deny: compile_lenient(&self.deny),
            allow: compile_lenient(&self.allow),
        })
    }

    pub(crate) fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        let bag = build_context(ctx);
        let lists = self.lists();

        // Deny first.
        if lists.deny.iter().any(|expr| eval_lenient(expr, &bag)) {
            return RuleResult::deny(RuleKind::Filter, DenyReason::Filter);
        }

        // Then a non-empty allow list must match something.
        if !self.allow.is_empty() && !lists.allow.iter().any(|expr| eval_lenient(expr, &bag)) {
            return RuleResult::deny(RuleKind::Filter, DenyReason::Filter);
        }

        RuleResult::allow(RuleKind::Filter)
    }
}

/// Compile, dropping (and logging) sources that fail.
///
/// Bad sources are caught by `validate` at engine construction; this
/// path only matters for rules built outside the engine.
fn compile_lenient(sources: &[String]) -> Vec<CompiledExpr> {
    sources
        .iter()
        .filter_map(|source| match CompiledExpr::compile(source) {
            Ok(expr) => Some(expr),
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "dropping unparsable filter expression");
                None
            }
        })
        .collect()
}

/// Evaluate; failures count as "predicate false".
fn eval_lenient(expr: &CompiledExpr, bag: &ExprContext) -> bool {
    match expr.eval(bag) {
        Ok(truthy) => truthy,
        Err(e) => {
            tracing::debug!(source = %expr.source(), error = %e, "filter expression failed, treating as false");
            false
        }
    }
}

/// Flatten the request into the expression namespace.
pub(crate) fn build_context(ctx: &RuleContext<'_>) -> ExprContext {
    let mut bag = ExprContext::new();

    for (key, value) in ctx.characteristics.iter() {
        match value.as_str() {
            Some(s) => bag.bind(key, s),
            None => {
                if let Some(n) = value.as_number() {
                    bag.bind(key, n);
                }
            }
        }
    }

    // Enriched IP fields under the ip.src namespace.
    let ip = ctx.ip;
    let mut bind_str = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            bag.bind(format!("ip.src.{name}"), value.as_str());
        }
    };
    bind_str("country", &ip.country);
    bind_str("country_name", &ip.country_name);
    bind_str("region", &ip.region);
    bind_str("city", &ip.city);
    bind_str("continent", &ip.continent);
    bind_str("timezone", &ip.timezone);
    bind_str("postal", &ip.postal_code);
    bind_str("asn_name", &ip.asn_name);
    bind_str("asn_domain", &ip.asn_domain);

    if let Some(asn) = ip.asn {
        bag.bind("ip.src.asn", asn as f64);
    }
    if let Some(lat) = ip.latitude {
        bag.bind("ip.src.latitude", lat);
    }
    if let Some(lon) = ip.longitude {
        bag.bind("ip.src.longitude", lon);
    }
    if let Some(asn_type) = ip.asn_type {
        bag.bind(
            "ip.src.asn_type",
            match asn_type {
                crate::ip::AsnType::Isp => "isp",
                crate::ip::AsnType::Hosting => "hosting",
                crate::ip::AsnType::Business => "business",
                crate::ip::AsnType::Education => "education",
            },
        );
    }

    bag.bind("ip.src.vpn", ip.is_vpn.unwrap_or(false));
    bag.bind("ip.src.proxy", ip.is_proxy.unwrap_or(false));
    bag.bind("ip.src.hosting", ip.is_hosting.unwrap_or(false));
    bag.bind("ip.src.relay", ip.is_relay.unwrap_or(false));
    bag.bind("ip.src.tor", ip.is_tor.unwrap_or(false));

    // Request surface.
    bag.bind("http.request.method", ctx.request.method.as_str());
    bag.bind("http.request.path", ctx.request.path());
    for (name, value) in ctx.request.headers() {
        bag.bind(format!("http.request.headers.{name}"), value);
    }

    bag
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
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                request: RequestContext::new("GET", "/api/data")
                    .with_header("User-Agent", "curl/8.0"),
                characteristics: Characteristics::new()
                    .with("ip.src", "8.8.8.8")
                    .with("tier", "free"),
                ip: IpInfo {
                    country: Some("CA".into()),
                    is_vpn: Some(true),
                    ..Default::default()
                },
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
    fn test_deny_expression() {
        let fixture = Fixture::new();
        let rule = FilterRule::new().deny([r#"ip.src.country ne "US""#]);

        let result = rule.evaluate(&fixture.ctx());
        assert!(result.is_deny());
        assert_eq!(result.reason, Some(DenyReason::Filter));
    }

    #[test]
    fn test_deny_misses_then_allows() {
        let fixture = Fixture::new();
        let rule = FilterRule::new().deny([r#"ip.src.country eq "RU""#]);
        assert!(!rule.evaluate(&fixture.ctx()).is_deny());
    }

    #[test]
    fn test_allow_list_requires_a_match() {
        let fixture = Fixture::new();

        let matching = FilterRule::new().allow([r#"tier in ["free", "pro"]"#]);
        assert!(!matching.evaluate(&fixture.ctx()).is_deny());

        let unmatched = FilterRule::new().allow([r#"tier eq "enterprise""#]);
        assert!(unmatched.evaluate(&fixture.ctx()).is_deny());
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let fixture = Fixture::new();
        let rule = FilterRule::new()
            .allow([r#"tier eq "free""#])
            .deny(["ip.src.vpn"]);
        assert!(rule.evaluate(&fixture.ctx()).is_deny());
    }

    #[test]
    fn test_empty_filter_allows() {
        let fixture = Fixture::new();
        assert!(!FilterRule::new().evaluate(&fixture.ctx()).is_deny());
    }

    #[test]
    fn test_header_binding() {
        let fixture = Fixture::new();
        let rule = FilterRule::new()
            .deny([r#"http.request.headers["user-agent"] matches ("^curl")"#]);
        assert!(rule.evaluate(&fixture.ctx()).is_deny());
    }

    #[test]
    fn test_ip_flag_binding() {
        let fixture = Fixture::new();
        let rule = FilterRule::new().deny(["ip.src.vpn"]);
        assert!(rule.evaluate(&fixture.ctx()).is_deny());

        let mut fixture = Fixture::new();
        fixture.ip.is_vpn = None;
        assert!(!rule.evaluate(&fixture.ctx()).is_deny());
    }

    #[test]
    fn test_unparsable_expression_is_false() {
        let fixture = Fixture::new();
        // Built directly (bypassing validate); the bad source drops out.
        let rule = FilterRule::new().deny(["((("]);
        assert!(!rule.evaluate(&fixture.ctx()).is_deny());
    }

    #[test]
    fn test_validate_surfaces_bad_sources() {
        assert!(FilterRule::new().deny(["((("]).validate().is_err());
        assert!(
            FilterRule::new()
                .deny([r#"a eq "b""#])
                .validate()
                .is_ok()
        );
    }
}
