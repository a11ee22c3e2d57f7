//! User-agent bot policy.
//!
//! Detection is UA-based against a curated signature table. Policy:
//! a configured `allow` list denies every detected bot not on it
//! (`allow: []` therefore blocks all bots); otherwise a `block` list
//! denies the bots it names; with neither, everything is allowed.
//! Unknown user agents are allowed; absence of a signature is not
//! evidence of automation.

use crate::decision::{DenyReason, RuleResult};
use crate::error::Result;
use crate::rules::{Mode, RuleContext, RuleKind};

/// UA substring → bot identifier.
const BOT_SIGNATURES: &[(&str, &str)] = &[
    ("googlebot", "googlebot"),
    ("bingbot", "bingbot"),
    ("yandexbot", "yandexbot"),
    ("duckduckbot", "duckduckbot"),
    ("baiduspider", "baiduspider"),
    ("slurp", "yahoo-slurp"),
    ("facebookexternalhit", "facebook"),
    ("twitterbot", "twitterbot"),
    ("linkedinbot", "linkedinbot"),
    ("semrushbot", "semrush"),
    ("ahrefsbot", "ahrefs"),
    ("mj12bot", "mj12"),
    ("gptbot", "gptbot"),
    ("ccbot", "ccbot"),
    ("claudebot", "claudebot"),
    ("bytespider", "bytespider"),
    ("curl/", "curl"),
    ("wget/", "wget"),
    ("python-requests", "python-requests"),
    ("python-urllib", "python-urllib"),
    ("aiohttp", "aiohttp"),
    ("axios/", "axios"),
    ("node-fetch", "node-fetch"),
    ("go-http-client", "go-http-client"),
    ("okhttp", "okhttp"),
    ("java/", "java-http"),
    ("scrapy", "scrapy"),
    ("headlesschrome", "headless-chrome"),
    ("phantomjs", "phantomjs"),
    ("selenium", "selenium"),
    ("puppeteer", "puppeteer"),
    ("playwright", "playwright"),
];

/// Generic markers caught after the signature table.
const GENERIC_MARKERS: &[&str] = &["bot", "crawler", "spider", "scraper"];

/// Bot detection configuration.
#[derive(Debug, Clone, Default)]
pub struct BotRule {
    /// Enforcement mode.
    pub mode: Mode,
    /// When set, detected bots not on this list are denied.
    /// `Some(vec![])` denies every detected bot.
    pub allow: Option<Vec<String>>,
    /// Denied bot identifiers, consulted when `allow` is unset.
    pub block: Vec<String>,
}

impl BotRule {
    /// Create a rule that allows everything until configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny every detected bot except those listed.
    pub fn allow(mut self, allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow = Some(allowed.into_iter().map(Into::into).collect());
        self
    }

    /// Deny the listed bots.
    pub fn block(mut self, blocked: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.block = blocked.into_iter().map(Into::into).collect();
        self
    }

    /// Switch to DRY_RUN.
    pub fn dry_run(mut self) -> Self {
        self.mode = Mode::DryRun;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Identify a bot from the user agent, if any.
    pub(crate) fn detect(user_agent: Option<&str>) -> Option<String> {
        let ua = user_agent?.to_ascii_lowercase();
        if ua.is_empty() {
            return None;
        }
        for (needle, id) in BOT_SIGNATURES {
            if ua.contains(needle) {
                return Some((*id).to_string());
            }
        }
        for marker in GENERIC_MARKERS {
            if ua.contains(marker) {
                return Some(format!("unknown-{marker}"));
            }
        }
        None
    }

    pub(crate) fn evaluate(&self, ctx: &RuleContext<'_>) -> RuleResult {
        let Some(bot) = Self::detect(ctx.request.user_agent()) else {
            // Unknown UA policy is allow.
            return RuleResult::allow(RuleKind::DetectBot);
        };

        let denied = match &self.allow {
            Some(allowed) => !allowed.iter().any(|entry| entry_matches(entry, &bot)),
            None => self.block.iter().any(|entry| entry_matches(entry, &bot)),
        };

        if denied {
            tracing::debug!(bot = %bot, "bot policy denied user agent");
            RuleResult::deny(RuleKind::DetectBot, DenyReason::Bot)
        } else {
            RuleResult::allow(RuleKind::DetectBot)
        }
    }
}

fn entry_matches(entry: &str, bot: &str) -> bool {
    entry.eq_ignore_ascii_case(bot)
}
