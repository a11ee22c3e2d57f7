//! Evaluator for parsed filter expressions.
//!
//! Evaluation binds identifiers against a flattened context bag and can
//! never execute host code: the only operations are comparisons, boolean
//! combinators, membership tests, and guarded regex matches.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::ExprError;
use crate::expr::parser::{CmpOp, Expr};

/// Regex patterns longer than this are rejected outright.
const PATTERN_MAX_LEN: usize = 1_000;

/// Maximum number of bounded quantifiers (`{m,n}`) in a pattern.
const PATTERN_MAX_BOUNDED: usize = 20;

/// Input to `matches` is truncated to this many characters.
const MATCH_INPUT_CAP: usize = 10_000;

/// Soft budget for a single regex evaluation.
const MATCH_BUDGET: Duration = Duration::from_millis(100);

/// A context value bound to an identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// String value.
    Str(String),
    /// Numeric value.
    Num(f64),
    /// Boolean value.
    Bool(bool),
}

impl ExprValue {
    /// String form used for value-equality comparisons.
    fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Self::Bool(b) => b.to_string(),
        }
    }

    /// Numeric form used for ordering comparisons.
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Bool(true) => Some(1.0),
            Self::Bool(false) => Some(0.0),
        }
    }

    /// Truthiness for bare values in boolean position.
    fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Num(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
        }
    }
}

impl From<&str> for ExprValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ExprValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<f64> for ExprValue {
    fn from(n: f64) -> Self {
        Self::Num(n)
    }
}

impl From<bool> for ExprValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Flattened identifier → value bag expressions evaluate against.
#[derive(Debug, Clone, Default)]
pub struct ExprContext {
    bindings: BTreeMap<String, ExprValue>,
}

impl ExprContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an identifier.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<ExprValue>) {
        self.bindings.insert(name.into(), value.into());
    }

    /// Builder-style bind.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ExprValue>) -> Self {
        self.bind(name, value);
        self
    }

    fn resolve(&self, name: &str) -> Option<&ExprValue> {
        self.bindings.get(name)
    }
}

/// Evaluate an expression tree to a boolean.
///
/// Unresolved identifiers behave as "missing": comparisons against them
/// are false, and their bare truthiness is false.
pub fn evaluate(expr: &Expr, ctx: &ExprContext) -> Result<bool, ExprError> {
    Ok(match eval_value(expr, ctx)? {
        Some(value) => value.truthy(),
        None => false,
    })
}

/// Evaluate a sub-expression to a value; `None` means missing.
fn eval_value(expr: &Expr, ctx: &ExprContext) -> Result<Option<ExprValue>, ExprError> {
    match expr {
        Expr::Str(s) => Ok(Some(ExprValue::Str(s.clone()))),
        Expr::Num(n) => Ok(Some(ExprValue::Num(*n))),
        Expr::Bool(b) => Ok(Some(ExprValue::Bool(*b))),
        Expr::Ident(name) => Ok(ctx.resolve(name).cloned()),
        Expr::Not(inner) => {
            let truthy = evaluate(inner, ctx)?;
            Ok(Some(ExprValue::Bool(!truthy)))
        }
        Expr::And(left, right) => {
            let result = evaluate(left, ctx)? && evaluate(right, ctx)?;
            Ok(Some(ExprValue::Bool(result)))
        }
        Expr::Or(left, right) => {
            let result = evaluate(left, ctx)? || evaluate(right, ctx)?;
            Ok(Some(ExprValue::Bool(result)))
        }
        Expr::Cmp(op, left, right) => {
            let (Some(l), Some(r)) = (eval_value(left, ctx)?, eval_value(right, ctx)?) else {
                return Ok(Some(ExprValue::Bool(false)));
            };
            Ok(Some(ExprValue::Bool(compare(*op, &l, &r))))
        }
        Expr::In(needle, haystack) => {
            let Some(needle) = eval_value(needle, ctx)? else {
                return Ok(Some(ExprValue::Bool(false)));
            };
            for item in haystack {
                if let Some(item) = eval_value(item, ctx)?
                    && compare(CmpOp::Eq, &needle, &item)
                {
                    return Ok(Some(ExprValue::Bool(true)));
                }
            }
            Ok(Some(ExprValue::Bool(false)))
        }
        Expr::Matches(subject, pattern) => {
            let (Some(subject), Some(pattern)) =
                (eval_value(subject, ctx)?, eval_value(pattern, ctx)?)
            else {
                return Ok(Some(ExprValue::Bool(false)));
            };
            let matched = regex_match(&subject.render(), &pattern.render())?;
            Ok(Some(ExprValue::Bool(matched)))
        }
    }
}

fn compare(op: CmpOp, left: &ExprValue, right: &ExprValue) -> bool {
    match op {
        // Value-equal when both operands agree after string coercion.
        CmpOp::Eq => left.render() == right.render(),
        CmpOp::Ne => left.render() != right.render(),
        // Ordering coerces to numbers; non-numeric operands never order.
        CmpOp::Gt | CmpOp::Lt | CmpOp::Ge | CmpOp::Le => {
            let (Some(l), Some(r)) = (left.as_number(), right.as_number()) else {
                return false;
            };
            match op {
                CmpOp::Gt => l > r,
                CmpOp::Lt => l < r,
                CmpOp::Ge => l >= r,
                CmpOp::Le => l <= r,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            }
        }
    }
}

/// Compile and run a regex under the ReDoS guards.
fn regex_match(input: &str, pattern: &str) -> Result<bool, ExprError> {
    check_pattern_safety(pattern)?;

    let regex = regex::Regex::new(pattern)
        .map_err(|e| ExprError::UnsafePattern(e.to_string()))?;

    let capped: &str = if input.len() > MATCH_INPUT_CAP {
        // Cut on a char boundary at or below the cap.
        let mut end = MATCH_INPUT_CAP;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        &input[..end]
    } else {
        input
    };

    let started = Instant::now();
    let matched = regex.is_match(capped);
    if started.elapsed() > MATCH_BUDGET {
        return Err(ExprError::RegexBudget(MATCH_BUDGET));
    }
    Ok(matched)
}

/// Reject patterns with obvious catastrophic-backtracking shapes.
///
/// The regex engine itself is linear-time, but these guards keep the
/// policy language portable to engines that are not, and bound the work
/// even for linear engines.
fn check_pattern_safety(pattern: &str) -> Result<(), ExprError> {
    if pattern.len() > PATTERN_MAX_LEN {
        return Err(ExprError::UnsafePattern(format!(
            "pattern length {} exceeds {PATTERN_MAX_LEN}",
            pattern.len()
        )));
    }

    let bytes = pattern.as_bytes();
    let mut bounded_quantifiers = 0;
    // Tracks, per open group, whether a quantifier occurred inside it.
    let mut group_stack: Vec<bool> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'(' => group_stack.push(false),
            b')' => {
                let had_quantifier = group_stack.pop().unwrap_or(false);
                let followed_by_quantifier = matches!(
                    bytes.get(i + 1),
                    Some(&b'*') | Some(&b'+') | Some(&b'{')
                );
                if had_quantifier && followed_by_quantifier {
                    return Err(ExprError::UnsafePattern(
                        "nested quantifier over a quantified group".into(),
                    ));
                }
                // A quantified group counts as a quantifier in its parent.
                if followed_by_quantifier && let Some(parent) = group_stack.last_mut() {
                    *parent = true;
                }
            }
            b'*' | b'+' => {
                if let Some(current) = group_stack.last_mut() {
                    *current = true;
                }
            }
            b'{' => {
                bounded_quantifiers += 1;
                if bounded_quantifiers > PATTERN_MAX_BOUNDED {
                    return Err(ExprError::UnsafePattern(format!(
                        "more than {PATTERN_MAX_BOUNDED} bounded quantifiers"
                    )));
                }
                if let Some(current) = group_stack.last_mut() {
                    *current = true;
                }
            }
            _ => {}
        }
        i += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;

    fn ctx() -> ExprContext {
        ExprContext::new()
            .with("ip.src.country", "CA")
            .with("ip.src.vpn", true)
            .with("tier", "free")
            .with("requests", 42.0)
            .with("http.request.headers.user-agent", "curl/8.0")
    }

    fn eval(input: &str) -> bool {
        evaluate(&parse(input).unwrap(), &ctx()).unwrap()
    }

    #[test]
    fn test_string_equality() {
        assert!(eval(r#"ip.src.country eq "CA""#));
        assert!(eval(r#"ip.src.country ne "US""#));
        assert!(!eval(r#"ip.src.country == "US""#));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(eval("requests > 40"));
        assert!(eval("requests <= 42"));
        assert!(!eval("requests < 42"));
        // String-typed numbers coerce.
        assert!(eval(r#"requests > "41""#));
        // Non-numeric operands never order.
        assert!(!eval(r#"tier > 5"#));
    }

    #[test]
    fn test_equality_coerces_via_string_form() {
        let ctx = ExprContext::new().with("n", 2.0).with("s", "2");
        assert!(evaluate(&parse("n == s").unwrap(), &ctx).unwrap());
    }

    #[test]
    fn test_boolean_logic() {
        assert!(eval(r#"ip.src.vpn and tier eq "free""#));
        assert!(eval(r#"tier eq "pro" or ip.src.vpn"#));
        assert!(eval("not (tier eq \"pro\")"));
        assert!(!eval("not ip.src.vpn"));
    }

    #[test]
    fn test_in_operator() {
        assert!(eval(r#"tier in ["free", "trial"]"#));
        assert!(!eval(r#"tier in ["pro", "enterprise"]"#));
        assert!(!eval("tier in []"));
    }

    #[test]
    fn test_matches() {
        assert!(eval(r#"http.request.headers["user-agent"] matches ("^curl")"#));
        assert!(!eval(r#"http.request.headers["user-agent"] matches ("^wget")"#));
    }

    #[test]
    fn test_missing_identifier_is_false() {
        assert!(!eval("nonexistent"));
        assert!(!eval(r#"nonexistent eq "x""#));
        assert!(!eval("nonexistent > 0"));
        // But negation of a missing value is true.
        assert!(eval("not nonexistent"));
    }

    #[test]
    fn test_pattern_guards_reject_nested_quantifiers() {
        assert!(regex_match("aaaa", "(a+)+b").is_err());
        assert!(regex_match("aaaa", "(a*)*b").is_err());
        assert!(regex_match("aaaa", "(a+)*b").is_err());
        // An inner quantified group quantified again at depth.
        assert!(regex_match("aaaa", "((a+)b)+c").is_err());
    }

    #[test]
    fn test_pattern_guards_allow_safe_patterns() {
        assert!(regex_match("hello world", "^hello").unwrap());
        assert!(regex_match("abc123", "[a-z]+[0-9]+").unwrap());
        assert!(!regex_match("abc", "^[0-9]+$").unwrap());
    }

    #[test]
    fn test_pattern_guards_reject_oversize() {
        let long = "a".repeat(PATTERN_MAX_LEN + 1);
        assert!(regex_match("x", &long).is_err());

        let many_bounded = "a{1,2}".repeat(PATTERN_MAX_BOUNDED + 1);
        assert!(regex_match("x", &many_bounded).is_err());
    }

    #[test]
    fn test_input_capped() {
        let huge = "a".repeat(MATCH_INPUT_CAP * 2);
        // Anchored-at-end pattern can't see past the cap.
        assert!(regex_match(&huge, "a$").unwrap());
    }

    #[test]
    fn test_invalid_pattern_is_error_not_panic() {
        assert!(regex_match("x", "(unclosed").is_err());
    }
}
