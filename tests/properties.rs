//! Cross-cutting invariants.
#![cfg(feature = "memory")]

use std::sync::Arc;

use guardrail::prelude::*;
use guardrail::{Clock, MemoryConfig, Storage};

fn request_from(ip: &str) -> RequestContext {
    RequestContext::new("GET", "/api")
        .with_header("X-Forwarded-For", ip)
        .with_header("User-Agent", "Mozilla/5.0")
}

#[tokio::test]
async fn test_rate_limit_bound_under_concurrency() {
    // With the atomic backend, admissions for one key never exceed max
    // regardless of interleaving.
    let config = GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 5u64));
    let engine = Arc::new(Guardrail::new(config, MemoryStorage::new()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let decision = engine
                .protect(&request_from("10.0.0.10"), &ProtectOptions::new())
                .await;
            decision.is_allowed()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
}

#[tokio::test]
async fn test_dry_run_transparency() {
    // A DRY_RUN rule reports exactly what the LIVE rule would have,
    // with the conclusion rewritten.
    let clock = Clock::fixed(1_700_000_000_000);

    let live_engine = Guardrail::builder()
        .config(GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 2u64)))
        .storage(MemoryStorage::new().with_clock(clock.clone()))
        .clock(clock.clone())
        .build()
        .unwrap();
    let dry_engine = Guardrail::builder()
        .config(GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 2u64).dry_run()))
        .storage(MemoryStorage::new().with_clock(clock.clone()))
        .clock(clock.clone())
        .build()
        .unwrap();

    let request = request_from("10.0.0.10");
    for round in 0..4 {
        let live = live_engine.protect(&request, &ProtectOptions::new()).await;
        let dry = dry_engine.protect(&request, &ProtectOptions::new()).await;

        // DRY_RUN never denies the decision.
        assert!(dry.is_allowed(), "round {round}");
        // Bookkeeping matches the live evaluation exactly.
        assert_eq!(
            live.results()[0].remaining,
            dry.results()[0].remaining,
            "round {round}"
        );
        assert_eq!(
            live.results()[0].limit,
            dry.results()[0].limit,
            "round {round}"
        );
        assert_eq!(
            live.results()[0].reset_at,
            dry.results()[0].reset_at,
            "round {round}"
        );
    }
}

#[tokio::test]
async fn test_token_bucket_monotonicity() {
    // Tokens never exceed capacity and decrease by exactly `requested`
    // on admission.
    let clock = Clock::fixed(0);
    let storage = MemoryStorage::new().with_clock(clock.clone());

    let mut last_remaining = None;
    for _ in 0..3 {
        let outcome = storage.token_bucket("tb-key", 10, 2, 1_000, 3).await.unwrap();
        assert!(outcome.remaining <= 10);
        if let Some(prev) = last_remaining {
            assert_eq!(outcome.remaining, prev - 3);
        }
        last_remaining = Some(outcome.remaining);
    }

    // Refill after many intervals still caps at capacity.
    clock.advance_ms(100_000);
    let outcome = storage.token_bucket("tb-key", 10, 2, 1_000, 0).await.unwrap();
    assert_eq!(outcome.remaining, 10);
}

#[tokio::test]
async fn test_fingerprint_keys_are_stable_across_processes() {
    // Two engines over the same storage see the same counters: the
    // fingerprint is deterministic.
    let storage = Arc::new(MemoryStorage::new());

    let engine_a = Guardrail::new(
        GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 2u64)),
        storage.clone(),
    )
    .unwrap();
    let engine_b = Guardrail::new(
        GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 2u64)),
        storage,
    )
    .unwrap();

    let request = request_from("10.0.0.10");
    assert!(engine_a.protect(&request, &ProtectOptions::new()).await.is_allowed());
    assert!(engine_b.protect(&request, &ProtectOptions::new()).await.is_allowed());
    // Budget shared across engines: third admission denied.
    assert!(engine_a.protect(&request, &ProtectOptions::new()).await.is_denied());
}

#[tokio::test]
async fn test_interval_literals_share_keys() {
    // "1m" and "60s" are the same window and must hit the same key.
    let storage = Arc::new(MemoryStorage::new());

    let engine_a = Guardrail::new(
        GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 1u64)),
        storage.clone(),
    )
    .unwrap();
    let engine_b = Guardrail::new(
        GuardrailConfig::new().rule(SlidingWindowRule::new("60s", 1u64)),
        storage,
    )
    .unwrap();

    let request = request_from("10.0.0.10");
    assert!(engine_a.protect(&request, &ProtectOptions::new()).await.is_allowed());
    assert!(engine_b.protect(&request, &ProtectOptions::new()).await.is_denied());
}

#[tokio::test]
async fn test_memory_storage_eviction_respects_capacity() {
    let storage = MemoryStorage::with_config(MemoryConfig {
        max_keys: 100,
        ..Default::default()
    });

    for i in 0..500 {
        storage
            .set(&format!("key-{i}"), "v", None)
            .await
            .unwrap();
    }
    assert!(storage.len() <= 100);
}

#[tokio::test]
async fn test_concurrent_distinct_keys_do_not_interfere() {
    let config = GuardrailConfig::new().rule(SlidingWindowRule::new("1m", 1u64));
    let engine = Arc::new(Guardrail::new(config, MemoryStorage::new()).unwrap());

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let ip = format!("203.0.113.{i}");
            engine
                .protect(&request_from(&ip), &ProtectOptions::new())
                .await
                .is_allowed()
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap());
    }
}
