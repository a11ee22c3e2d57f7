//! Decision → HTTP response mapping helpers for adapters.

use crate::decision::{Decision, DenyReason};

/// Response headers for a decision.
///
/// Always `X-Guardrail-Id` and `X-Guardrail-Conclusion`; when a
/// rate-limit rule evaluated, also `X-RateLimit-Remaining` and
/// `X-RateLimit-Reset` (epoch seconds).
pub fn decision_headers(decision: &Decision) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("X-Guardrail-Id", decision.id().to_string()),
        (
            "X-Guardrail-Conclusion",
            decision.conclusion().as_str().to_string(),
        ),
    ];

    if let Some(result) = decision.rate_limit_result() {
        if let Some(remaining) = result.remaining {
            headers.push(("X-RateLimit-Remaining", remaining.to_string()));
        }
        if let Some(reset_at) = result.reset_at {
            headers.push(("X-RateLimit-Reset", (reset_at / 1_000).to_string()));
        }
    }

    headers
}

/// HTTP status an adapter should answer a denial with.
///
/// Rate limits and quotas map to 429; everything else is a 403.
pub fn deny_status(decision: &Decision) -> u16 {
    match decision.reason().reason() {
        Some(DenyReason::RateLimit) | Some(DenyReason::Quota) => 429,
        _ => 403,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristics::Characteristics;
    use crate::decision::RuleResult;
    use crate::ip::IpInfo;
    use crate::rules::RuleKind;
    use std::collections::BTreeMap;

    fn decision_with(results: Vec<RuleResult>) -> Decision {
        Decision::assemble(
            "id-1".into(),
            results,
            IpInfo::default(),
            Characteristics::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_headers_always_carry_id_and_conclusion() {
        let decision = decision_with(vec![RuleResult::allow(RuleKind::Shield)]);
        let headers = decision_headers(&decision);

        assert!(headers.iter().any(|(k, v)| *k == "X-Guardrail-Id" && v == "id-1"));
        assert!(
            headers
                .iter()
                .any(|(k, v)| *k == "X-Guardrail-Conclusion" && v == "ALLOW")
        );
        assert!(!headers.iter().any(|(k, _)| *k == "X-RateLimit-Remaining"));
    }

    #[test]
    fn test_rate_limit_headers() {
        let decision = decision_with(vec![
            RuleResult::allow(RuleKind::SlidingWindow).with_limit_info(10, 7, 1_700_000_123_456),
        ]);
        let headers = decision_headers(&decision);

        assert!(
            headers
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Remaining" && v == "7")
        );
        assert!(
            headers
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Reset" && v == "1700000123")
        );
    }

    #[test]
    fn test_deny_status_mapping() {
        use crate::decision::DenyReason;

        let rate_limited = decision_with(vec![RuleResult::deny(
            RuleKind::SlidingWindow,
            DenyReason::RateLimit,
        )]);
        assert_eq!(deny_status(&rate_limited), 429);

        let quota = decision_with(vec![RuleResult::deny(
            RuleKind::TokenBucket,
            DenyReason::Quota,
        )]);
        assert_eq!(deny_status(&quota), 429);

        let bot = decision_with(vec![RuleResult::deny(RuleKind::DetectBot, DenyReason::Bot)]);
        assert_eq!(deny_status(&bot), 403);

        let shield = decision_with(vec![RuleResult::deny(RuleKind::Shield, DenyReason::Shield)]);
        assert_eq!(deny_status(&shield), 403);
    }
}
