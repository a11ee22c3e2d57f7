//! Dynamic limit resolution.
//!
//! A rate-limit parameter (`max`, `capacity`, `refill_rate`) may be a
//! literal, an async function of the request context, or a dotted path
//! into the request's metadata, options, or characteristics. Functions
//! run under a deadline; paths are validated against traversal abuse.
//! Any rejection or failure resolves to the caller-supplied default, so
//! a broken resolver can never turn a limit infinite.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::characteristics::Characteristics;
use crate::error::ValidationError;

/// Deadline for resolver functions.
const FUNCTION_DEADLINE: Duration = Duration::from_secs(5);

/// Maximum path depth.
const PATH_MAX_DEPTH: usize = 10;

/// Segment names that are never traversed.
const FORBIDDEN_SEGMENTS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Boxed future returned by resolver functions.
pub type ResolverFuture<T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, String>> + Send>>;

/// Resolver function over an owned context snapshot.
pub type ResolverFn<T> = Arc<dyn Fn(ResolveContext) -> ResolverFuture<T> + Send + Sync>;

/// Context snapshot a dynamic value resolves against.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    /// Caller-supplied metadata.
    pub metadata: BTreeMap<String, Value>,
    /// Scalar fields from the options bag (`userId`, `email`, `tier`,
    /// `requested`).
    pub options: BTreeMap<String, Value>,
    /// Extracted characteristics.
    pub characteristics: Characteristics,
}

/// A value that may be computed per request.
#[derive(Clone)]
pub enum DynamicValue<T> {
    /// A fixed value.
    Literal(T),
    /// A dotted path resolved against the context
    /// (`metadata` → `options` → `characteristics`, or an absolute
    /// `metadata.` / `options.` / `characteristics.` prefix).
    Path(String),
    /// An async function of the context, bounded by a 5 s deadline.
    Function(ResolverFn<T>),
}

impl<T: std::fmt::Debug> std::fmt::Debug for DynamicValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Self::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl<T> From<T> for DynamicValue<T> {
    fn from(value: T) -> Self {
        Self::Literal(value)
    }
}

/// Conversion from a resolved JSON value.
pub trait FromResolved: Sized {
    /// Convert, returning `None` when the shape doesn't fit.
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromResolved for u64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromResolved for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromResolved for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl<T> DynamicValue<T>
where
    T: FromResolved + Clone + Send + 'static,
{
    /// Resolve to a concrete value, falling back to `default` on any
    /// rejection, failure, or timeout.
    pub async fn resolve(&self, ctx: &ResolveContext, default: T) -> T {
        self.resolve_opt(ctx).await.unwrap_or(default)
    }

    /// Resolve to a concrete value; `None` on any rejection, failure,
    /// or timeout. Callers without a configured fallback treat `None`
    /// as a rule error.
    pub async fn resolve_opt(&self, ctx: &ResolveContext) -> Option<T> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Path(path) => match resolve_path(path, ctx) {
                Ok(Some(value)) => T::from_value(&value),
                Ok(None) => None,
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "dynamic path rejected");
                    None
                }
            },
            Self::Function(func) => {
                match tokio::time::timeout(FUNCTION_DEADLINE, func(ctx.clone())).await {
                    Ok(Ok(value)) => Some(value),
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "dynamic function failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!("dynamic function exceeded {FUNCTION_DEADLINE:?}");
                        None
                    }
                }
            }
        }
    }

    /// Key discriminator: present only for path-based values, so that
    /// different dynamic-limit instances never share a bucket key.
    pub fn key_discriminator(&self) -> Option<String> {
        match self {
            Self::Path(path) => Some(
                path.chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Validate a dotted path and look it up in the context.
fn resolve_path(path: &str, ctx: &ResolveContext) -> Result<Option<Value>, ValidationError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.len() > PATH_MAX_DEPTH {
        return Err(ValidationError::UnsafePath(path.to_string()));
    }
    for segment in &segments {
        let valid = !segment.is_empty()
            && segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$');
        if !valid || FORBIDDEN_SEGMENTS.contains(segment) {
            return Err(ValidationError::UnsafePath(path.to_string()));
        }
    }

    // Absolute prefixes bypass the search order.
    let (bags, segments): (Vec<&dyn Bag>, &[&str]) = match segments[0] {
        "metadata" if segments.len() > 1 => (vec![&ctx.metadata], &segments[1..]),
        "options" if segments.len() > 1 => (vec![&ctx.options], &segments[1..]),
        "characteristics" if segments.len() > 1 => (vec![&ctx.characteristics], &segments[1..]),
        _ => (
            vec![&ctx.metadata, &ctx.options, &ctx.characteristics],
            &segments[..],
        ),
    };

    for bag in bags {
        if let Some(value) = bag.lookup(segments) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// A name bag a path can resolve against.
trait Bag {
    fn lookup(&self, segments: &[&str]) -> Option<Value>;
}

impl Bag for BTreeMap<String, Value> {
    fn lookup(&self, segments: &[&str]) -> Option<Value> {
        // Flat key first ("limits.daily" stored literally), then nested
        // traversal.
        let flat = segments.join(".");
        if let Some(value) = self.get(&flat) {
            return Some(value.clone());
        }

        let mut current = self.get(segments[0])?;
        for segment in &segments[1..] {
            current = current.as_object()?.get(*segment)?;
        }
        Some(current.clone())
    }
}

impl Bag for Characteristics {
    fn lookup(&self, segments: &[&str]) -> Option<Value> {
        // Characteristics keys are flat and may themselves contain dots.
        let flat = segments.join(".");
        self.get(&flat).map(|v| match v.as_number() {
            Some(n) if v.as_str().is_none() => serde_json::json!(n),
            _ => Value::String(v.render()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolveContext {
        let mut metadata = BTreeMap::new();
        metadata.insert("limit".to_string(), serde_json::json!(500));
        metadata.insert(
            "plan".to_string(),
            serde_json::json!({"daily": 1000, "name": "pro"}),
        );
        metadata.insert("tier".to_string(), serde_json::json!("metadata-tier"));

        let mut options = BTreeMap::new();
        options.insert("requested".to_string(), serde_json::json!(5));
        options.insert("tier".to_string(), serde_json::json!("options-tier"));

        ResolveContext {
            metadata,
            options,
            characteristics: Characteristics::new()
                .with("ip.src", "1.2.3.4")
                .with("tier", "characteristics-tier"),
        }
    }

    #[tokio::test]
    async fn test_literal() {
        let value: DynamicValue<u64> = DynamicValue::Literal(42);
        assert_eq!(value.resolve(&ctx(), 1).await, 42);
    }

    #[tokio::test]
    async fn test_path_flat_metadata() {
        let value: DynamicValue<u64> = DynamicValue::Path("limit".into());
        assert_eq!(value.resolve(&ctx(), 1).await, 500);
    }

    #[tokio::test]
    async fn test_path_nested_traversal() {
        let value: DynamicValue<u64> = DynamicValue::Path("plan.daily".into());
        assert_eq!(value.resolve(&ctx(), 1).await, 1000);
    }

    #[tokio::test]
    async fn test_search_order_metadata_first() {
        let value: DynamicValue<String> = DynamicValue::Path("tier".into());
        assert_eq!(
            value.resolve(&ctx(), "default".into()).await,
            "metadata-tier"
        );
    }

    #[tokio::test]
    async fn test_absolute_prefix_bypasses_search() {
        let value: DynamicValue<String> = DynamicValue::Path("options.tier".into());
        assert_eq!(
            value.resolve(&ctx(), "default".into()).await,
            "options-tier"
        );

        let value: DynamicValue<String> = DynamicValue::Path("characteristics.tier".into());
        assert_eq!(
            value.resolve(&ctx(), "default".into()).await,
            "characteristics-tier"
        );
    }

    #[tokio::test]
    async fn test_missing_path_yields_default() {
        let value: DynamicValue<u64> = DynamicValue::Path("no.such.key".into());
        assert_eq!(value.resolve(&ctx(), 7).await, 7);
    }

    #[tokio::test]
    async fn test_prototype_segments_rejected() {
        for path in [
            "__proto__",
            "plan.__proto__",
            "constructor.limit",
            "metadata.prototype",
        ] {
            let value: DynamicValue<u64> = DynamicValue::Path(path.into());
            assert_eq!(value.resolve(&ctx(), 9).await, 9, "{path}");
        }
    }

    #[tokio::test]
    async fn test_prototype_path_mutates_nothing() {
        let ctx = ctx();
        let before = ctx.metadata.clone();
        let value: DynamicValue<u64> = DynamicValue::Path("plan.__proto__.daily".into());
        value.resolve(&ctx, 0).await;
        assert_eq!(ctx.metadata, before);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let deep = (0..12).map(|i| format!("s{i}")).collect::<Vec<_>>().join(".");
        let value: DynamicValue<u64> = DynamicValue::Path(deep);
        assert_eq!(value.resolve(&ctx(), 3).await, 3);
    }

    #[tokio::test]
    async fn test_invalid_segment_characters_rejected() {
        for path in ["a-b", "a..b", "a b", "", "a.b!"] {
            let value: DynamicValue<u64> = DynamicValue::Path(path.into());
            assert_eq!(value.resolve(&ctx(), 2).await, 2, "{path:?}");
        }
    }

    #[tokio::test]
    async fn test_type_mismatch_yields_default() {
        // "plan" is an object; not convertible to u64.
        let value: DynamicValue<u64> = DynamicValue::Path("plan".into());
        assert_eq!(value.resolve(&ctx(), 11).await, 11);
    }

    #[tokio::test]
    async fn test_function_resolves() {
        let value: DynamicValue<u64> = DynamicValue::Function(Arc::new(|ctx| {
            Box::pin(async move {
                let requested = ctx
                    .options
                    .get("requested")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                Ok(requested * 100)
            })
        }));
        assert_eq!(value.resolve(&ctx(), 1).await, 500);
    }

    #[tokio::test]
    async fn test_function_error_yields_default() {
        let value: DynamicValue<u64> =
            DynamicValue::Function(Arc::new(|_| Box::pin(async { Err("nope".to_string()) })));
        assert_eq!(value.resolve(&ctx(), 13).await, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_function_timeout_yields_default() {
        let value: DynamicValue<u64> = DynamicValue::Function(Arc::new(|_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(999)
            })
        }));
        assert_eq!(value.resolve(&ctx(), 21).await, 21);
    }

    #[test]
    fn test_key_discriminator_only_for_paths() {
        let literal: DynamicValue<u64> = DynamicValue::Literal(5);
        assert_eq!(literal.key_discriminator(), None);

        let path: DynamicValue<u64> = DynamicValue::Path("plan.daily".into());
        assert_eq!(path.key_discriminator(), Some("plan.daily".into()));
    }
}
