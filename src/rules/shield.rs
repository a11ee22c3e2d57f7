//! Payload attack scanner.
//!
//! Classifies a request as a suspected attack across a fixed set of
//! categories using a table-driven regex corpus. The URL, query string,
//! and a selected set of headers are always scanned; the body only when
//! the adapter opted in (off by default, JSON bodies trip too many
//! lookalike patterns).

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::decision::{DenyReason, RuleResult};
use crate::error::Result;
use crate::rules::{Mode, RuleContext, RuleKind};

/// Headers scanned on every request.
const SCANNED_HEADERS: &[&str] = &["user-agent", "referer", "cookie", "x-api-key"];

/// URLs longer than this are anomalous on their own.
const URL_LENGTH_CAP: usize = 8_192;

/// Attack categories the scanner recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttackCategory {
    /// SQL injection.
    SqlInjection,
    /// Cross-site scripting.
    Xss,
    /// Shell command injection.
    CommandInjection,
    /// Filesystem path traversal.
    PathTraversal,
    /// LDAP filter injection.
    LdapInjection,
    /// XML external entity injection.
    Xxe,
    /// CRLF / header injection.
    HeaderInjection,
    /// Log forging.
    LogInjection,
    /// Structural anomalies (null bytes, absurd lengths).
    Anomaly,
}

impl AttackCategory {
    /// All categories, the default configuration.
    pub fn all() -> Vec<Self> {
        vec![
            Self::SqlInjection,
            Self::Xss,
            Self::CommandInjection,
            Self::PathTraversal,
            Self::LdapInjection,
            Self::Xxe,
            Self::HeaderInjection,
            Self::LogInjection,
            Self::Anomaly,
        ]
    }

    /// Label used in logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlInjection => "sql-injection",
            Self::Xss => "xss",
            Self::CommandInjection => "command-injection",
            Self::PathTraversal => "path-traversal",
            Self::LdapInjection => "ldap-injection",
            Self::Xxe => "xxe",
            Self::HeaderInjection => "header-injection",
            Self::LogInjection => "log-injection",
            Self::Anomaly => "anomaly",
        }
    }
}

/// The pattern corpus. Grouped per category; all patterns are static and
/// covered by a compile-them-all test.
const PATTERNS: &[(AttackCategory, &str)] = &[
    // SQL injection
    (
        AttackCategory::SqlInjection,
        r"(?i)\b(union\s+(all\s+)?select|select\s+.*\bfrom\b|insert\s+into|drop\s+table|delete\s+from|update\s+\w+\s+set)\b",
    ),
    (
        AttackCategory::SqlInjection,
        r#"(?i)('|%27)\s*(or|and)\s+[\w'"]+\s*=\s*"#,
    ),
    (AttackCategory::SqlInjection, r"(?i);\s*(drop|alter|truncate)\b"),
    (
        AttackCategory::SqlInjection,
        r"(?i)\b(sleep|benchmark)\s*\(|waitfor\s+delay",
    ),
    // XSS
    (AttackCategory::Xss, r"(?i)<\s*script"),
    (AttackCategory::Xss, r"(?i)javascript\s*:"),
    (
        AttackCategory::Xss,
        r"(?i)\bon(load|error|click|mouseover|focus)\s*=",
    ),
    (AttackCategory::Xss, r"(?i)<\s*(iframe|object|embed)\b"),
    (
        AttackCategory::Xss,
        r"(?i)document\s*\.\s*(cookie|write)|window\s*\.\s*location",
    ),
    // Command injection
    (
        AttackCategory::CommandInjection,
        r"(?i)[;&|]\s*(cat|ls|rm|wget|curl|bash|sh|powershell|cmd)\b",
    ),
    (AttackCategory::CommandInjection, r"`[^`]*`"),
    (AttackCategory::CommandInjection, r"\$\([^)]*\)"),
    (AttackCategory::CommandInjection, r"(?i)\b(nc|netcat)\s+-"),
    // Path traversal
    (AttackCategory::PathTraversal, r"\.\./|\.\.\\"),
    (AttackCategory::PathTraversal, r"(?i)%2e%2e(%2f|%5c)"),
    (
        AttackCategory::PathTraversal,
        r"(?i)/etc/(passwd|shadow)|c:\\windows",
    ),
    // LDAP injection
    (AttackCategory::LdapInjection, r"\(\s*[|&]\s*\("),
    (AttackCategory::LdapInjection, r"\*\s*\)\s*\("),
    // XXE
    (AttackCategory::Xxe, r"(?i)<!DOCTYPE[^>]*\["),
    (AttackCategory::Xxe, r"(?i)<!ENTITY"),
    (AttackCategory::Xxe, r#"(?i)SYSTEM\s+["']file:"#),
    // Header injection
    (AttackCategory::HeaderInjection, r"%0[dD]%0[aA]|[\r\n]"),
    // Log injection
    (
        AttackCategory::LogInjection,
        r"(?i)(%0a|%0d|\n|\r)\s*\[?(info|error|warn|debug)\]?\s*[:\]]",
    ),
];

/// Payload attack scanner configuration.
#[derive(Clone)]
pub struct ShieldRule {
    /// Enforcement mode.
    pub mode: Mode,
    /// Enabled categories; defaults to all of them.
    pub categories: Vec<AttackCategory>,
    /// Scan the request body too. Off by default.
    pub scan_body: bool,
    compiled: Arc<Vec<(AttackCategory, Regex)>>,
}

impl std::fmt::Debug for ShieldRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShieldRule")
            .field("mode", &self.mode)
            .field("categories", &self.categories)
            .field("scan_body", &self.scan_body)
            .finish()
    }
}

impl Default for ShieldRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ShieldRule {
    /// Create a scanner with every category enabled.
    pub fn new() -> Self {
        let compiled = PATTERNS
            .iter()
            .map(|(category, pattern)| {
                (
                    *category,
                    // The corpus is static; a bad pattern is a bug caught
                    // by tests, not a runtime condition.
                    Regex::new(pattern).expect("static shield pattern"),
                )
            })
            .collect();
        Self {
            mode: Mode::Live,
            categories: AttackCategory::all(),
            scan_body: false,
            compiled: Arc::new(compiled),
        }
    }

    /// Restrict to the given categories.
    pub fn categories(mut self, categories: impl IntoIterator<Item = AttackCategory>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    /// Opt in to body scanning.
    pub fn scan_body(mut self) -> Self {
        self.scan_body = true;
        self
    }

    /// Switch to DRY_RUN.
    pub fn dry_run(mut self) -> Self {
        self.mode = Mode::DryRun;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            return Err(crate::error::ConfigError::InvalidRule(
                "shield needs at least one enabled category".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Scan the request; any enabled-category match denies.
    pub(crate) fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        match self.scan(ctx) {
            Some(category) => {
                tracing::debug!(category = category.as_str(), "shield matched attack pattern");
                RuleResult::deny(RuleKind::Shield, DenyReason::Shield)
            }
            None => RuleResult::allow(RuleKind::Shield),
        }
    }

    /// First enabled category that matches, if any.
    pub(crate) fn scan(&self, ctx: &RuleContext<'_>) -> Option<AttackCategory> {
        // (text, is_body): bodies are legitimately multi-line, so the
        // CRLF-based categories only apply to URL and header targets.
        let mut targets: Vec<(String, bool)> = Vec::new();
        targets.push((ctx.request.url.clone(), false));
        let decoded = percent_decode(&ctx.request.url);
        if decoded != ctx.request.url {
            targets.push((decoded, false));
        }
        for header in SCANNED_HEADERS {
            if let Some(value) = ctx.request.header(header) {
                targets.push((value.to_string(), false));
            }
        }
        if self.scan_body && let Some(body) = &ctx.request.body {
            targets.push((body.clone(), true));
        }

        // Structural anomalies first; they need no regex.
        if self.categories.contains(&AttackCategory::Anomaly) {
            let anomalous = ctx.request.url.len() > URL_LENGTH_CAP
                || targets
                    .iter()
                    .any(|(t, _)| t.contains('\0') || t.contains("%00"));
            if anomalous {
                return Some(AttackCategory::Anomaly);
            }
        }

        for (category, regex) in self.compiled.iter() {
            if !self.categories.contains(category) {
                continue;
            }
            let crlf_based = matches!(
                category,
                AttackCategory::HeaderInjection | AttackCategory::LogInjection
            );
            if targets
                .iter()
                .any(|(t, is_body)| !(crlf_based && *is_body) && regex.is_match(t))
            {
                return Some(*category);
            }
        }
        None
    }
}

/// Minimal percent-decoding, enough to expose encoded attack payloads.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2]))
        {
            out.push(hi * 16 + lo);
            i += 3;
        } else if bytes[i] == b'+' {
            out.push(b' ');
            i += 1;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
