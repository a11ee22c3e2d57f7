//! Sandboxed boolean expression language for filter rules.
//!
//! A small predicate language over request characteristics and enriched
//! IP fields:
//!
//! ```text
//! ip.src.country ne "US"
//! tier in ["free", "trial"] and not ip.src.vpn
//! http.request.headers["user-agent"] matches ("^curl")
//! ```
//!
//! Expressions are tokenized, parsed with operator precedence
//! (`or` < `and` < `not` < comparison), and evaluated against a
//! flattened context bag. There is no execution path out of the
//! language: identifiers resolve to data, `matches` runs behind ReDoS
//! guards, and malformed input is an error the filter rule treats as
//! "predicate false".

mod eval;
mod lexer;
mod parser;

pub use eval::{ExprContext, ExprValue, evaluate};
pub use parser::{CmpOp, Expr, parse};

use crate::error::ExprError;

/// A parsed, reusable filter expression.
///
/// Filter rules compile their expressions once and evaluate them per
/// request.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    tree: Expr,
}

impl CompiledExpr {
    /// Parse and compile an expression.
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            source: source.to_string(),
            tree: parse(source)?,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a context bag.
    pub fn eval(&self, ctx: &ExprContext) -> Result<bool, ExprError> {
        evaluate(&self.tree, ctx)
    }
}
