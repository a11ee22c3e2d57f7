//! Programmable request-admission engine for Rust services.
//!
//! `guardrail` produces a [`Decision`] (allow/deny with a structured
//! reason) for each inbound request by composing a pipeline of rules:
//!
//! - **Rate limits**: sliding window and token bucket, with atomic
//!   storage primitives or an optimistic-CAS fallback
//! - **Content rules**: payload attack scanning (Shield), bot
//!   detection, email validation, and a sandboxed filter expression
//!   language
//! - **IP intelligence**: multi-provider geolocation with circuit
//!   breakers, health tracking, layered caches, and a VPN/proxy
//!   classifier
//! - **Pluggable storage**: in-memory with TTL + LRU eviction, Redis
//!   with server-side atomic scripts
//!
//! # Quick Start
//!
//! ```ignore
//! use guardrail::{
//!     Guardrail, GuardrailConfig, MemoryStorage, ProtectOptions, RequestContext,
//!     rules::SlidingWindowRule,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 100u64));
//!     let engine = Guardrail::new(config, MemoryStorage::new()).unwrap();
//!
//!     let request = RequestContext::new("GET", "/api/data")
//!         .with_header("X-Forwarded-For", "203.0.113.7");
//!     let decision = engine.protect(&request, &ProtectOptions::new()).await;
//!
//!     if decision.is_denied() {
//!         println!("denied: {:?}", decision.reason().message());
//!     }
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `memory` (default): in-memory storage backend
//! - `redis`: Redis storage backend with Lua atomic primitives
//! - `ip-http`: HTTP geolocation provider (reqwest)

pub mod breaker;
pub mod characteristics;
pub mod clock;
pub mod config;
pub mod decision;
pub mod dynamic;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod headers;
pub mod interval;
pub mod ip;
pub mod presets;
pub mod request;
pub mod rules;
pub mod storage;
pub mod telemetry;

// Re-export main types
pub use characteristics::{CharacteristicValue, Characteristics};
pub use clock::Clock;
pub use config::{ErrorPolicy, EvaluationStrategy, GuardrailConfig, ListCriteria};
pub use decision::{Conclusion, Decision, DenyReason, RuleResult};
pub use engine::{Guardrail, GuardrailBuilder};
pub use error::{ConfigError, GuardrailError, Result, StorageError};
pub use presets::Preset;
pub use request::{ProtectOptions, RequestContext};
pub use rules::{Mode, Rule, RuleKind};
pub use storage::{AtomicOutcome, Storage, StorageCapabilities};
pub use telemetry::Telemetry;

// Re-export decision helpers
pub use headers::{decision_headers, deny_status};

// Re-export IP types
pub use ip::{IpInfo, IpIntelligence, IpIntelligenceConfig, IpProvider, VpnClassifier};

// Re-export circuit breaker
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};

// Re-export storage types
#[cfg(feature = "memory")]
pub use storage::{MemoryConfig, MemoryStorage};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisStorage};

#[cfg(feature = "ip-http")]
pub use ip::HttpIpProvider;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ErrorPolicy, EvaluationStrategy, GuardrailConfig, ListCriteria};
    pub use crate::decision::{Conclusion, Decision, DenyReason, RuleResult};
    pub use crate::engine::Guardrail;
    pub use crate::error::{GuardrailError, Result};
    pub use crate::presets::Preset;
    pub use crate::request::{ProtectOptions, RequestContext};
    pub use crate::rules::{
        BotRule, EmailReason, EmailRule, FilterRule, Mode, Rule, ShieldRule, SlidingWindowRule,
        TokenBucketRule,
    };
    pub use crate::storage::Storage;

    #[cfg(feature = "memory")]
    pub use crate::storage::MemoryStorage;

    #[cfg(feature = "redis")]
    pub use crate::storage::{RedisConfig, RedisStorage};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_rate_limit() {
        use crate::prelude::*;

        let config = GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 2u64));
        let engine = Guardrail::new(config, MemoryStorage::new()).unwrap();
        let request = RequestContext::new("GET", "/api")
            .with_header("X-Forwarded-For", "203.0.113.7");

        for _ in 0..2 {
            let decision = engine.protect(&request, &ProtectOptions::new()).await;
            assert!(decision.is_allowed());
        }

        let decision = engine.protect(&request, &ProtectOptions::new()).await;
        assert!(decision.is_denied());
        assert!(decision.reason().is_rate_limit());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_headers() {
        use crate::prelude::*;

        let config = GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 10u64));
        let engine = Guardrail::new(config, MemoryStorage::new()).unwrap();
        let request = RequestContext::new("GET", "/api")
            .with_header("X-Forwarded-For", "203.0.113.7");

        let decision = engine.protect(&request, &ProtectOptions::new()).await;
        let headers = decision_headers(&decision);

        assert!(headers.iter().any(|(k, _)| *k == "X-Guardrail-Id"));
        assert!(headers.iter().any(|(k, _)| *k == "X-Guardrail-Conclusion"));
        assert!(headers.iter().any(|(k, _)| *k == "X-RateLimit-Remaining"));
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_preset() {
        use crate::prelude::*;

        let config = GuardrailConfig::new().preset(Preset::Strict);
        let engine = Guardrail::new(config, MemoryStorage::new()).unwrap();

        let bot = RequestContext::new("GET", "/")
            .with_header("X-Forwarded-For", "203.0.113.7")
            .with_header("User-Agent", "Googlebot/2.1");
        let decision = engine.protect(&bot, &ProtectOptions::new()).await;
        assert!(decision.is_denied());
        assert!(decision.reason().is_bot());
    }
}
