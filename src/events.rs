//! Structured engine events.
//!
//! The engine emits an [`Event`] at each observable point; sinks are
//! pluggable. The default sink logs through `tracing`, so deployments
//! get structured output with no wiring.

use serde::Serialize;

use crate::decision::DenyReason;

/// Type-specific event payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    /// A rule is about to evaluate.
    RuleEvaluate {
        /// Rule kind label.
        rule: &'static str,
    },
    /// A rule allowed the request.
    RuleAllow {
        /// Rule kind label.
        rule: &'static str,
    },
    /// A rule denied the request.
    RuleDeny {
        /// Rule kind label.
        rule: &'static str,
        /// Deny reason label.
        reason: &'static str,
    },
    /// The decision admitted the request.
    DecisionAllowed,
    /// The decision refused the request.
    DecisionDenied {
        /// Deny reason label.
        reason: &'static str,
    },
    /// A storage operation failed.
    StorageError {
        /// Failed operation name.
        op: &'static str,
        /// Failure detail.
        message: String,
    },
    /// IP lookup failed across providers.
    IpLookupError {
        /// Failure detail.
        message: String,
    },
}

impl EventKind {
    /// Canonical event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RuleEvaluate { .. } => "rule.evaluate",
            Self::RuleAllow { .. } => "rule.allow",
            Self::RuleDeny { .. } => "rule.deny",
            Self::DecisionAllowed => "decision.allowed",
            Self::DecisionDenied { .. } => "decision.denied",
            Self::StorageError { .. } => "storage.error",
            Self::IpLookupError { .. } => "ip-lookup.error",
        }
    }
}

/// An emitted event: payload plus the common envelope fields.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Type-specific payload.
    #[serde(flatten)]
    pub kind: EventKind,
    /// Emission time, epoch milliseconds.
    pub timestamp_ms: u64,
    /// Decision this event belongs to, when applicable.
    pub decision_id: Option<String>,
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    /// Handle one event. Must not block.
    fn emit(&self, event: &Event);
}

/// Default sink: logs each event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &Event) {
        match &event.kind {
            EventKind::RuleDeny { rule, reason } => {
                tracing::info!(
                    event = event.kind.name(),
                    rule,
                    reason,
                    decision_id = event.decision_id.as_deref(),
                    "rule denied request"
                );
            }
            EventKind::DecisionDenied { reason } => {
                tracing::info!(
                    event = event.kind.name(),
                    reason,
                    decision_id = event.decision_id.as_deref(),
                    "request denied"
                );
            }
            EventKind::StorageError { op, message } => {
                tracing::warn!(event = event.kind.name(), op, %message, "storage error");
            }
            EventKind::IpLookupError { message } => {
                tracing::warn!(event = event.kind.name(), %message, "ip lookup error");
            }
            kind => {
                tracing::debug!(
                    event = kind.name(),
                    decision_id = event.decision_id.as_deref(),
                    "engine event"
                );
            }
        }
    }
}

/// Helper for building events with the envelope filled in.
pub(crate) fn event(kind: EventKind, timestamp_ms: u64, decision_id: Option<&str>) -> Event {
    Event {
        kind,
        timestamp_ms,
        decision_id: decision_id.map(String::from),
    }
}

/// Reason label, `"none"` when the decision allowed.
pub(crate) fn reason_label(reason: Option<DenyReason>) -> &'static str {
    reason.map(|r| r.as_str()).unwrap_or("none")
}
