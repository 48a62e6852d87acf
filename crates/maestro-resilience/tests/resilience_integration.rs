#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_core::{ErrorKind, MaestroError};
use maestro_events::{topics, EventBus, Handler};
use maestro_resilience::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker_config(threshold: u32, recovery_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: threshold,
        recovery_timeout_ms: recovery_ms,
        half_open_max_calls: 1,
    }
}

fn record_topics(events: &EventBus, log: &Arc<Mutex<Vec<String>>>) {
    let log = log.clone();
    events.subscribe(
        topics::ALL,
        Handler::sync(move |event| {
            log.lock().push(event.event_type.clone());
            Ok(())
        }),
        0,
    );
}

// ---------------------------------------------------------------------------
// 1. Five consecutive failures open the circuit; the sixth call never reaches the target
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sixth_call_within_recovery_is_rejected() {
    let breaker = CircuitBreaker::new("analyzer", breaker_config(5, 30_000));
    let invoked = AtomicU32::new(0);

    for _ in 0..5 {
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MaestroError::Network("refused".into()))
            })
            .await;
        assert!(matches!(result, Err(MaestroError::Network(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(10_000)).await;
    let sixth = breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, MaestroError>(())
        })
        .await;

    assert!(matches!(sixth, Err(MaestroError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 5);
}

// ---------------------------------------------------------------------------
// 2. After the recovery timeout exactly one probe goes through and closes the circuit
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn probe_after_recovery_closes_circuit() {
    let breaker = CircuitBreaker::new("analyzer", breaker_config(2, 1_000));
    for _ in 0..2 {
        let _ = breaker
            .call(|| async { Err::<(), _>(MaestroError::Timeout("slow".into())) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    let probe = breaker.call(|| async { Ok::<_, MaestroError>("pong") }).await;
    assert_eq!(probe.unwrap(), "pong");

    let snap = breaker.snapshot();
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.failure_count, 0);
    assert_eq!(snap.half_open_probes_used, 0);
    assert_eq!(snap.total_failures, 2);
}

// ---------------------------------------------------------------------------
// 3. Immediate retries still honour the retryable-error filter
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn immediate_strategy_respects_retryable_filter() {
    let events = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    record_topics(&events, &seen);
    let executor = RetryExecutor::new().with_event_bus(events);
    let calls = AtomicU32::new(0);

    let err = executor
        .execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MaestroError::Validation("missing field 'path'".into())) }
            },
            &RetryPolicy::immediate(5),
            &RetryContext::new("wf", "parse", "mock"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MaestroError::Validation(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.lock(),
        vec![topics::RETRY_ATTEMPT, topics::RETRY_ABORTED]
    );
}

// ---------------------------------------------------------------------------
// 4. Backoff delays are genuine sleeps and every step is reported with identifiers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exponential_backoff_reports_each_step() {
    let events = Arc::new(EventBus::new());
    let payloads = Arc::new(Mutex::new(Vec::new()));
    let payloads_clone = payloads.clone();
    events.subscribe(
        topics::RETRY_DELAY,
        Handler::sync(move |event| {
            payloads_clone.lock().push(event.data.clone());
            Ok(())
        }),
        0,
    );
    let executor = RetryExecutor::new().with_event_bus(events);
    let policy = RetryPolicy {
        strategy: RetryStrategy::ExponentialBackoff,
        max_attempts: 3,
        initial_delay_ms: 100,
        backoff_factor: 2.0,
        max_delay_ms: 1_000,
        ..RetryPolicy::default()
    };

    let start = tokio::time::Instant::now();
    let err = executor
        .execute_with_retry(
            |_| async { Err::<(), _>(MaestroError::Unavailable("503".into())) },
            &policy,
            &RetryContext::new("wf-7", "build", "agent-a"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MaestroError::RetryExhausted { attempts: 3, .. }));
    assert_eq!(err.kind(), ErrorKind::RetryExhausted);
    assert!(start.elapsed() >= Duration::from_millis(300));

    let payloads = payloads.lock();
    let delays: Vec<u64> = payloads.iter().map(|p| p["delay_ms"].as_u64().unwrap()).collect();
    assert_eq!(delays, vec![100, 200]);
    assert_eq!(payloads[0]["workflow_id"], "wf-7");
    assert_eq!(payloads[0]["task_id"], "build");
}

// ---------------------------------------------------------------------------
// 5. A guarded retry stops as soon as its breaker opens
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn guarded_retry_stops_when_circuit_opens() {
    let registry = Arc::new(CircuitBreakerRegistry::new(breaker_config(2, 60_000)));
    let executor = RetryExecutor::new().with_breakers(registry.clone());
    let policy = RetryPolicy {
        strategy: RetryStrategy::CircuitBreakerGuarded,
        max_attempts: 5,
        initial_delay_ms: 10,
        ..RetryPolicy::default()
    }
    .with_circuit_breaker("remote");
    let calls = AtomicU32::new(0);

    let err = executor
        .execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MaestroError::Network("reset".into())) }
            },
            &policy,
            &RetryContext::new("wf", "t", "remote"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MaestroError::CircuitOpen { target } if target == "remote"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.get("remote").unwrap().state(), CircuitState::Open);
}
