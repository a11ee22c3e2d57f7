//! The decision engine.
//!
//! [`Guardrail::protect`] runs the full pipeline for one request:
//! characteristic extraction, IP enrichment, whitelist/blacklist
//! short-circuits, rule evaluation under the configured strategy and
//! error policy, and decision assembly with events and metrics.
//! `protect` never returns an error; internal failures route through
//! the fail-open/fail-closed policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde_json::Value;

use crate::characteristics::Characteristics;
use crate::clock::Clock;
use crate::config::{ErrorPolicy, EvaluationStrategy, GuardrailConfig};
use crate::decision::{Decision, DenyReason, RuleResult};
use crate::dynamic::ResolveContext;
use crate::error::{GuardrailError, Result, RuleError};
use crate::events::{EventKind, EventSink, TracingEventSink, event, reason_label};
use crate::ip::{IpInfo, IpIntelligence, VpnClassifier};
use crate::presets::compose_rules;
use crate::request::{ProtectOptions, RequestContext};
use crate::rules::{Mode, Rule, RuleContext, RuleKind};
use crate::storage::Storage;

/// The request-admission engine.
///
/// Construction validates the configuration; a misconfigured engine
/// never exists. One instance serves many concurrent requests.
pub struct Guardrail<S> {
    config: GuardrailConfig,
    /// Rules after preset composition, in evaluation order.
    rules: Vec<Rule>,
    storage: Arc<S>,
    ip_intel: Option<Arc<IpIntelligence<S>>>,
    classifier: VpnClassifier,
    events: Arc<dyn EventSink>,
    clock: Clock,
}

impl<S: Storage> Guardrail<S> {
    /// Start building an engine.
    pub fn builder() -> GuardrailBuilder<S> {
        GuardrailBuilder::new()
    }

    /// Convenience constructor: config + storage, defaults elsewhere.
    pub fn new(config: GuardrailConfig, storage: S) -> Result<Self> {
        Self::builder().config(config).storage(storage).build()
    }

    /// The composed rule list, in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Produce a decision for one request.
    pub async fn protect(&self, request: &RequestContext, options: &ProtectOptions) -> Decision {
        self.protect_with_rules(request, options, &[]).await
    }

    /// Like [`protect`](Self::protect), with route-level rules composed
    /// above the engine's own (route wins per-kind conflicts).
    pub async fn protect_with_rules(
        &self,
        request: &RequestContext,
        options: &ProtectOptions,
        route_rules: &[Rule],
    ) -> Decision {
        let started = Instant::now();
        let id = uuid::Uuid::new_v4().to_string();

        // 1. Characteristics.
        let characteristics = self.extract_characteristics(request, options);

        // 2. IP enrichment.
        let mut ip_info = self.enrich_ip(request, &id).await;
        self.classifier.enrich(&mut ip_info);
        self.export_breaker_gauges();

        // 3. List checks. Whitelist wins over blacklist.
        let ip = request.client_ip();
        let country = ip_info.country.as_deref();
        let user_id = options.user_id.as_deref();
        let email = options.email.as_deref();

        if let Some(whitelist) = &self.config.whitelist
            && whitelist.matches(ip, user_id, country, email)
        {
            let decision =
                Decision::assemble(id, Vec::new(), ip_info, characteristics, options.metadata.clone());
            self.finish(&decision, started, "whitelist");
            return decision;
        }

        if let Some(blacklist) = &self.config.blacklist
            && blacklist.matches(ip, user_id, country, email)
        {
            let results = vec![RuleResult::deny(RuleKind::Filter, DenyReason::Filter)];
            let decision =
                Decision::assemble(id, results, ip_info, characteristics, options.metadata.clone());
            self.finish(&decision, started, "blacklist");
            return decision;
        }

        // 4. Select rules.
        let composed;
        let rules: &[Rule] = if route_rules.is_empty() {
            &self.rules
        } else {
            composed = compose_rules(&[route_rules, self.rules.as_slice()], None);
            &composed
        };

        // 5–6. Evaluate.
        let resolve = ResolveContext {
            metadata: options.metadata.clone(),
            options: options_bag(options),
            characteristics: characteristics.clone(),
        };
        let rule_ctx = RuleContext {
            request,
            characteristics: &characteristics,
            ip: &ip_info,
            resolve: &resolve,
            key_prefix: &self.config.key_prefix,
            requested: options.requested.unwrap_or(1),
            email,
        };

        let results = match self.config.evaluation_strategy {
            EvaluationStrategy::Sequential => {
                let mut results = Vec::with_capacity(rules.len());
                for rule in rules {
                    results.push(self.evaluate_rule(rule, &rule_ctx, &id).await);
                }
                results
            }
            EvaluationStrategy::ShortCircuit => {
                let mut results = Vec::with_capacity(rules.len());
                for rule in rules {
                    let result = self.evaluate_rule(rule, &rule_ctx, &id).await;
                    let deny = result.is_deny();
                    results.push(result);
                    if deny {
                        break;
                    }
                }
                results
            }
            EvaluationStrategy::Parallel => {
                join_all(
                    rules
                        .iter()
                        .map(|rule| self.evaluate_rule(rule, &rule_ctx, &id)),
                )
                .await
            }
        };

        // 7. Assemble.
        let decision =
            Decision::assemble(id, results, ip_info, characteristics, options.metadata.clone());
        self.finish(&decision, started, "rules");
        decision
    }

    fn extract_characteristics(
        &self,
        request: &RequestContext,
        options: &ProtectOptions,
    ) -> Characteristics {
        let mut characteristics = Characteristics::new();
        characteristics.insert("ip.src", request.client_ip());
        if let Some(user_id) = &options.user_id {
            characteristics.insert("userId", user_id.as_str());
        }
        if let Some(tier) = &options.tier {
            characteristics.insert("tier", tier.as_str());
        }
        if let Some(email) = &options.email {
            characteristics.insert("email", email.as_str());
        }
        // Extra configured keys fall back to header extraction.
        for key in &self.config.by {
            if characteristics.get(key).is_none()
                && let Some(value) = request.header(key)
            {
                characteristics.insert(key.as_str(), value);
            }
        }
        characteristics
    }

    async fn enrich_ip(&self, request: &RequestContext, decision_id: &str) -> IpInfo {
        let Some(intel) = &self.ip_intel else {
            return IpInfo::default();
        };
        match intel.lookup(request.client_ip()).await {
            Ok(info) => info,
            Err(e) => {
                metrics::counter!("guardrail_errors_total", "type" => "ip-lookup").increment(1);
                self.events.emit(&event(
                    EventKind::IpLookupError {
                        message: e.to_string(),
                    },
                    self.clock.now_ms(),
                    Some(decision_id),
                ));
                IpInfo::default()
            }
        }
    }

    fn export_breaker_gauges(&self) {
        if let Some(intel) = &self.ip_intel {
            for (name, state) in intel.breaker_states() {
                metrics::gauge!("guardrail_circuit_breaker_state", "name" => name).set(state);
            }
        }
    }

    async fn evaluate_rule(
        &self,
        rule: &Rule,
        ctx: &RuleContext<'_>,
        decision_id: &str,
    ) -> RuleResult {
        let kind = rule.kind();
        let rule_started = Instant::now();
        self.events.emit(&event(
            EventKind::RuleEvaluate {
                rule: kind.as_str(),
            },
            self.clock.now_ms(),
            Some(decision_id),
        ));

        let fut = rule.evaluate(ctx, &*self.storage, &self.clock);
        let outcome = match self.config.rule_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GuardrailError::Rule(RuleError::new(
                    kind.as_str(),
                    format!("evaluation exceeded {deadline:?}"),
                ))),
            },
            None => fut.await,
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(error) => self.apply_error_policy(rule, error, decision_id),
        };

        // A global DRY_RUN disarms even fail-closed denials.
        if self.config.mode == Some(Mode::DryRun) {
            result = result.into_dry_run();
        }

        let elapsed_ms = rule_started.elapsed().as_secs_f64() * 1_000.0;
        metrics::histogram!("guardrail_rule_duration_milliseconds", "rule" => kind.as_str())
            .record(elapsed_ms);
        metrics::counter!(
            "guardrail_rule_evaluations_total",
            "rule" => kind.as_str(),
            "conclusion" => result.conclusion.as_str()
        )
        .increment(1);
        if let Some(remaining) = result.remaining {
            metrics::gauge!("guardrail_rate_limit_remaining", "rule" => kind.as_str())
                .set(remaining as f64);
        }

        let event_kind = match result.reason {
            Some(reason) if result.is_deny() => EventKind::RuleDeny {
                rule: kind.as_str(),
                reason: reason.as_str(),
            },
            _ => EventKind::RuleAllow {
                rule: kind.as_str(),
            },
        };
        self.events
            .emit(&event(event_kind, self.clock.now_ms(), Some(decision_id)));

        result
    }

    fn apply_error_policy(
        &self,
        rule: &Rule,
        error: GuardrailError,
        decision_id: &str,
    ) -> RuleResult {
        let kind = rule.kind();
        let error_type = match &error {
            GuardrailError::Storage(e) => {
                self.events.emit(&event(
                    EventKind::StorageError {
                        op: e.op_name(),
                        message: e.to_string(),
                    },
                    self.clock.now_ms(),
                    Some(decision_id),
                ));
                "storage"
            }
            GuardrailError::Rule(_) => "rule",
            GuardrailError::Expr(_) => "expression",
            _ => "internal",
        };
        metrics::counter!("guardrail_errors_total", "type" => error_type).increment(1);
        tracing::warn!(rule = kind.as_str(), error = %error, "rule evaluation failed");

        let policy = rule.error_policy().unwrap_or(self.config.error_handling);
        match policy {
            ErrorPolicy::FailOpen => RuleResult::errored(kind, error_type),
            ErrorPolicy::FailClosed => {
                let denial = RuleResult::deny(kind, rule.canonical_reason());
                match rule.mode() {
                    // DRY_RUN rules never deny, even failing closed.
                    Mode::DryRun => denial.into_dry_run(),
                    Mode::Live => denial,
                }
            }
        }
    }

    fn finish(&self, decision: &Decision, started: Instant, path: &'static str) {
        let reason = reason_label(decision.reason().reason());
        let denying_rule = decision
            .results()
            .iter()
            .find(|r| r.is_deny())
            .map(|r| r.kind.as_str())
            .unwrap_or("none");

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        metrics::histogram!("guardrail_request_duration_milliseconds").record(elapsed_ms);
        metrics::counter!(
            "guardrail_requests_total",
            "conclusion" => decision.conclusion().as_str(),
            "rule" => denying_rule,
            "reason" => reason
        )
        .increment(1);
        metrics::counter!(
            "guardrail_decisions_total",
            "conclusion" => decision.conclusion().as_str(),
            "reason" => reason
        )
        .increment(1);

        let kind = if decision.is_allowed() {
            EventKind::DecisionAllowed
        } else {
            EventKind::DecisionDenied { reason }
        };
        self.events
            .emit(&event(kind, self.clock.now_ms(), Some(decision.id())));

        tracing::debug!(
            decision_id = decision.id(),
            conclusion = decision.conclusion().as_str(),
            path,
            elapsed_ms,
            "decision assembled"
        );
    }
}

impl<S> std::fmt::Debug for Guardrail<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guardrail")
            .field("rules", &self.rules.len())
            .field("strategy", &self.config.evaluation_strategy)
            .finish()
    }
}

/// Scalar options exposed to dynamic path resolution.
fn options_bag(options: &ProtectOptions) -> BTreeMap<String, Value> {
    let mut bag = BTreeMap::new();
    if let Some(user_id) = &options.user_id {
        bag.insert("userId".to_string(), Value::String(user_id.clone()));
    }
    if let Some(email) = &options.email {
        bag.insert("email".to_string(), Value::String(email.clone()));
    }
    if let Some(tier) = &options.tier {
        bag.insert("tier".to_string(), Value::String(tier.clone()));
    }
    if let Some(requested) = options.requested {
        bag.insert("requested".to_string(), serde_json::json!(requested));
    }
    bag
}

/// Builder for [`Guardrail`].
pub struct GuardrailBuilder<S> {
    config: GuardrailConfig,
    storage: Option<S>,
    ip_intel: Option<IpIntelligence<S>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Clock,
}

impl<S: Storage> Default for GuardrailBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> GuardrailBuilder<S> {
    /// Create a builder with an empty configuration.
    pub fn new() -> Self {
        Self {
            config: GuardrailConfig::new(),
            storage: None,
            ip_intel: None,
            events: None,
            clock: Clock::system(),
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: GuardrailConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the storage backend.
    pub fn storage(mut self, storage: S) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Enable IP enrichment.
    pub fn ip_service(mut self, intel: IpIntelligence<S>) -> Self {
        self.ip_intel = Some(intel);
        self
    }

    /// Replace the default (tracing) event sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Replace the time source. Tests pin a fixed clock here.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and build the engine.
    pub fn build(self) -> Result<Guardrail<S>> {
        self.config.validate()?;
        let storage = Arc::new(self.storage.ok_or_else(|| {
            crate::error::ConfigError::MissingRequired("storage backend".into())
        })?);

        let rules = compose_rules(&[self.config.rules.as_slice()], self.config.preset);
        for rule in &rules {
            rule.validate()?;
        }

        tracing::info!(
            rules = rules.len(),
            strategy = ?self.config.evaluation_strategy,
            "guardrail engine constructed"
        );

        Ok(Guardrail {
            config: self.config,
            rules,
            storage,
            ip_intel: self.ip_intel.map(Arc::new),
            classifier: VpnClassifier::new(),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(TracingEventSink)),
            clock: self.clock,
        })
    }
}
