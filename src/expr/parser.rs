//! Pratt-style parser for the filter expression language.
//!
//! Grammar, loosest to tightest: `or` → `and` → `not` → comparison →
//! value. Comparisons do not chain (`a < b < c` is a parse error), which
//! keeps the language predictable for policy authors.

use crate::error::ExprError;
use crate::expr::lexer::{Token, tokenize};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==` / `eq`
    Eq,
    /// `!=` / `ne`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `<=`
    Le,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String literal.
    Str(String),
    /// Numeric literal.
    Num(f64),
    /// Boolean literal.
    Bool(bool),
    /// Context identifier (dotted path).
    Ident(String),
    /// Logical negation.
    Not(Box<Expr>),
    /// Logical conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Binary comparison.
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// Membership test against an array literal.
    In(Box<Expr>, Vec<Expr>),
    /// Regex match: `value matches (pattern)`.
    Matches(Box<Expr>, Box<Expr>),
}

/// Maximum nesting depth; bounds parser recursion on hostile input.
const MAX_DEPTH: usize = 64;

/// Parse an expression string into an [`Expr`] tree.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "unexpected trailing token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::Parse(format!(
                "expression nesting exceeds {MAX_DEPTH}"
            )));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(ExprError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            self.descend()?;
            let inner = self.parse_not()?;
            self.ascend();
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_value()?;

        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::In) => {
                self.next();
                let array = self.parse_array()?;
                return Ok(Expr::In(Box::new(left), array));
            }
            Some(Token::Matches) => {
                self.next();
                self.expect(&Token::LParen)?;
                let pattern = self.parse_value()?;
                self.expect(&Token::RParen)?;
                return Ok(Expr::Matches(Box::new(left), Box::new(pattern)));
            }
            _ => None,
        };

        match op {
            Some(op) => {
                self.next();
                let right = self.parse_value()?;
                Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_value(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.ascend();
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(ExprError::Parse(format!("expected value, found {other:?}"))),
        }
    }

    fn parse_array(&mut self) -> Result<Vec<Expr>, ExprError> {
        self.expect(&Token::LBracket)?;
        let mut items = Vec::new();

        if self.peek() == Some(&Token::RBracket) {
            self.next();
            return Ok(items);
        }

        loop {
            items.push(self.parse_value()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                other => {
                    return Err(ExprError::Parse(format!(
                        "expected ',' or ']', found {other:?}"
                    )));
                }
            }
        }
        Ok(items)
    }
}
