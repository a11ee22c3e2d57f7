//! The abstract request capability consumed by the engine.
//!
//! Framework adapters build a [`RequestContext`] from their native request
//! type and pass it to [`crate::Guardrail::protect`] together with a
//! [`ProtectOptions`] bag. The engine never touches a framework type.

use std::collections::BTreeMap;

use serde_json::Value;

/// Header lookups are case-insensitive; keys are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// HTTP method (`GET`, `POST`, ...).
    pub method: String,
    /// Full request URL or path-and-query.
    pub url: String,
    headers: BTreeMap<String, String>,
    /// Request body, when the adapter opted in to forwarding it.
    pub body: Option<String>,
}

impl RequestContext {
    /// Create a request context for the given method and URL.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Add a header. Names are lowercased for lookup.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Attach the request body (opt-in; enables body scanning in Shield).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Iterate over `(name, value)` header pairs.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The client IP for this request.
    ///
    /// First entry of `X-Forwarded-For`, else `X-Real-IP`, else
    /// `"unknown"`.
    pub fn client_ip(&self) -> &str {
        if let Some(xff) = self.header("x-forwarded-for") {
            let first = xff.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first;
            }
        }
        if let Some(real) = self.header("x-real-ip") {
            let real = real.trim();
            if !real.is_empty() {
                return real;
            }
        }
        "unknown"
    }

    /// The `User-Agent` header, if present.
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// The query string portion of the URL, if any.
    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q)
    }

    /// The path portion of the URL (scheme/host stripped when present).
    pub fn path(&self) -> &str {
        let without_query = self.url.split('?').next().unwrap_or(&self.url);
        match without_query.find("://") {
            Some(idx) => {
                let after_scheme = &without_query[idx + 3..];
                match after_scheme.find('/') {
                    Some(slash) => &after_scheme[slash..],
                    None => "/",
                }
            }
            None => without_query,
        }
    }
}

/// Per-invocation options supplied by the caller alongside the request.
#[derive(Debug, Clone, Default)]
pub struct ProtectOptions {
    /// Authenticated user id, if known.
    pub user_id: Option<String>,
    /// Email address to validate, when an email rule is configured.
    pub email: Option<String>,
    /// Caller-assigned tier (`"free"`, `"pro"`, ...).
    pub tier: Option<String>,
    /// Tokens to consume from token-bucket rules (default 1).
    pub requested: Option<u64>,
    /// Free-form metadata, resolvable by dynamic limit paths.
    pub metadata: BTreeMap<String, Value>,
}

impl ProtectOptions {
    /// Create an empty options bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the email address.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the tier.
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Set the requested token count.
    pub fn with_requested(mut self, requested: u64) -> Self {
        self.requested = Some(requested);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
