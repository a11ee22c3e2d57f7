//! Error types for admission-engine operations.
//!
//! This module provides the error hierarchy for every component: storage
//! failures, configuration problems, rule evaluation failures, and the
//! boundary-validation errors that internal components translate into safe
//! defaults.

use std::time::Duration;
use thiserror::Error;

/// Result type for admission-engine operations.
pub type Result<T> = std::result::Result<T, GuardrailError>;

/// Main error type for admission-engine operations.
#[derive(Debug, Error)]
pub enum GuardrailError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error. Raised at construction; fatal.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A rule failed internally during evaluation.
    #[error("Rule evaluation failed: {0}")]
    Rule(#[from] RuleError),

    /// IP geolocation failed across all providers.
    #[error("IP lookup failed: {0}")]
    IpLookup(#[from] IpLookupError),

    /// Filter expression parse or evaluation failure.
    #[error("Expression error: {0}")]
    Expr(#[from] ExprError),

    /// A circuit-breaker-wrapped dependency is open.
    #[error("Circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    /// Boundary validation failure (invalid IP, oversized payload, unsafe path).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage-related errors. Carries the operation name so the engine can
/// attribute failures in events and metrics.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic storage operation failed.
    #[error("{op}: {message}")]
    OperationFailed {
        /// Name of the storage operation that failed.
        op: &'static str,
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Optimistic concurrency retries exhausted.
    #[error("Atomic operation failed, state was modified concurrently")]
    AtomicConflict,

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Stored blob exceeded the size or nesting limits.
    #[error("Stored value rejected: {0}")]
    ValueRejected(String),
}

impl StorageError {
    /// Create a new operation failed error.
    pub fn operation_failed(op: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            op,
            message: message.into(),
            retryable,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::AtomicConflict => true,
            Self::PoolExhausted => true,
            _ => false,
        }
    }

    /// Name of the failed operation, for `storage.error` events.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::OperationFailed { op, .. } => op,
            Self::Serialization(_) => "serialize",
            Self::AtomicConflict => "compare_and_swap",
            Self::PoolExhausted => "connect",
            Self::ValueRejected(_) => "parse",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid rule shape (non-positive max, empty pattern list, ...).
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Interval literal did not parse to a positive duration.
    #[error("Invalid interval literal: {0:?}")]
    InvalidInterval(String),

    /// Unknown mode, strategy, or preset name.
    #[error("Unknown variant {value:?} for {field}")]
    UnknownVariant {
        /// Config field with the bad value.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Invalid storage configuration (bad prefix, bad URL).
    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),
}

/// Rule evaluation errors. Carries the rule kind for error events.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RuleError {
    /// Kind of the rule that failed (e.g. "sliding-window").
    pub kind: &'static str,
    /// What went wrong.
    pub message: String,
}

impl RuleError {
    /// Create a new rule error.
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// IP geolocation errors. Non-fatal: the decision continues with an
/// empty `IpInfo`.
#[derive(Debug, Error)]
pub enum IpLookupError {
    /// Every configured provider failed.
    #[error("All {0} providers failed")]
    AllProvidersFailed(usize),

    /// The overall lookup budget was exhausted before any provider answered.
    #[error("Lookup budget exhausted after {0:?}")]
    BudgetExhausted(Duration),

    /// A provider returned a response larger than the hard cap.
    #[error("Provider response exceeded {max_bytes} bytes")]
    ResponseTooLarge {
        /// The configured cap.
        max_bytes: usize,
    },

    /// A single provider attempt failed.
    #[error("Provider {provider}: {message}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Failure detail.
        message: String,
    },
}

/// Filter-expression errors. At the rule level these are treated as
/// "predicate evaluates false" and logged.
#[derive(Debug, Error)]
pub enum ExprError {
    /// Tokenizer rejected the input.
    #[error("Lex error at offset {offset}: {message}")]
    Lex {
        /// Byte offset of the offending character.
        offset: usize,
        /// What the tokenizer expected.
        message: String,
    },

    /// Parser rejected the token stream.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Regex pattern rejected by the ReDoS guards.
    #[error("Unsafe regex pattern: {0}")]
    UnsafePattern(String),

    /// Regex evaluation exceeded its soft budget.
    #[error("Regex evaluation exceeded {0:?}")]
    RegexBudget(Duration),
}

/// Raised when a circuit-breaker-wrapped call is rejected or times out.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker is open; the protected function was not called.
    #[error("Circuit {name:?} is open")]
    Open {
        /// Breaker name.
        name: String,
    },

    /// The per-call deadline expired; counted as a failure.
    #[error("Circuit {name:?} call timed out after {deadline:?}")]
    Timeout {
        /// Breaker name.
        name: String,
        /// The deadline that expired.
        deadline: Duration,
    },
}

/// Boundary-validation errors. Internal components catch these and fall
/// back to safe defaults rather than surfacing them to callers.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Not a syntactically valid IP address.
    #[error("Invalid IP address: {0:?}")]
    InvalidIp(String),

    /// Private, reserved, loopback, or multicast address.
    #[error("Non-routable IP address: {0}")]
    NonRoutableIp(String),

    /// JSON blob exceeded size or nesting limits.
    #[error("Oversized or over-nested JSON: {0}")]
    OversizedJson(String),

    /// Dotted path contained an unsafe segment or was too deep.
    #[error("Unsafe resolution path: {0:?}")]
    UnsafePath(String),

    /// No characteristic resolved while building a fingerprint.
    #[error("No characteristics matched the configured keys")]
    EmptyFingerprint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_retryable() {
        let err = StorageError::operation_failed("get", "test", true);
        assert!(err.is_retryable());

        let err = StorageError::operation_failed("set", "test", false);
        assert!(!err.is_retryable());

        let err = StorageError::AtomicConflict;
        assert!(err.is_retryable());

        let err = StorageError::Serialization("bad json".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_error_op_name() {
        let err = StorageError::operation_failed("increment", "boom", true);
        assert_eq!(err.op_name(), "increment");
        assert_eq!(StorageError::AtomicConflict.op_name(), "compare_and_swap");
    }

    #[test]
    fn test_error_display() {
        let err = GuardrailError::from(RuleError::new("sliding-window", "state corrupt"));
        assert_eq!(
            err.to_string(),
            "Rule evaluation failed: sliding-window: state corrupt"
        );

        let err = ConfigError::UnknownVariant {
            field: "evaluationStrategy",
            value: "EVENTUAL".into(),
        };
        assert!(err.to_string().contains("EVENTUAL"));
    }

    #[test]
    fn test_breaker_error_display() {
        let err = BreakerError::Open {
            name: "ip-provider".into(),
        };
        assert!(err.to_string().contains("open"));
    }
}
