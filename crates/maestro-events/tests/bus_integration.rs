#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_core::MaestroError;
use maestro_events::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting(counter: &Arc<AtomicUsize>) -> Handler {
    let counter = counter.clone();
    Handler::sync(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// 1. One raising handler among N: the other N-1 still run, error counted once
// ---------------------------------------------------------------------------

#[test]
fn one_failing_handler_among_many() {
    let bus = EventBus::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let n = 6;
    let mut failing_id = 0;
    for i in 0..n {
        if i == 2 {
            failing_id = bus.subscribe(
                topics::TASK_FAILED,
                Handler::sync(|_| Err(MaestroError::Handler("observer down".into()))),
                0,
            );
        } else {
            bus.subscribe(topics::TASK_FAILED, counting(&counter), 0);
        }
    }

    let invoked = bus.publish(topics::TASK_FAILED, &json!({"task_id": "a"}));

    assert_eq!(invoked, n);
    assert_eq!(counter.load(Ordering::SeqCst), n - 1);
    let stats = bus.handler_stats();
    let failing = stats[topics::TASK_FAILED]
        .iter()
        .find(|s| s.handler_id == failing_id)
        .unwrap();
    assert_eq!(failing.error_count, 1);
    let healthy_errors: u64 = stats[topics::TASK_FAILED]
        .iter()
        .filter(|s| s.handler_id != failing_id)
        .map(|s| s.error_count)
        .sum();
    assert_eq!(healthy_errors, 0);
}

// ---------------------------------------------------------------------------
// 2. Async handlers run concurrently; a failing one does not block the others
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn async_handlers_run_concurrently() {
    let bus = EventBus::new();
    let finished = Arc::new(AtomicUsize::new(0));

    for delay_ms in [300u64, 200, 100] {
        let finished = finished.clone();
        bus.subscribe(
            topics::TASK_COMPLETED,
            Handler::from_async(move |_| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            0,
        );
    }
    let failing_id = bus.subscribe(
        topics::TASK_COMPLETED,
        Handler::from_async(|_| async { Err(MaestroError::Handler("flaky sink".into())) }),
        0,
    );

    let start = tokio::time::Instant::now();
    let invoked = bus.publish_async(topics::TASK_COMPLETED, &json!({})).await;

    assert_eq!(invoked, 4);
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    // Concurrent: total wait is the longest handler, not the sum.
    assert!(start.elapsed() < Duration::from_millis(600));

    let stats = bus.handler_stats();
    for s in &stats[topics::TASK_COMPLETED] {
        assert_eq!(s.execution_count, 1);
        assert!(s.is_async);
        assert_eq!(s.error_count, u64::from(s.handler_id == failing_id));
    }
}

// ---------------------------------------------------------------------------
// 3. Wildcard subscribers see every event type with its injected name
// ---------------------------------------------------------------------------

#[test]
fn wildcard_sees_every_event() {
    let bus = EventBus::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    bus.subscribe(
        topics::ALL,
        Handler::sync(move |event| {
            seen_clone
                .lock()
                .push(event.get_str(EVENT_TYPE_FIELD).unwrap_or_default().to_string());
            Ok(())
        }),
        0,
    );

    bus.publish(topics::WORKFLOW_STARTED, &json!({"workflow_id": "wf"}));
    bus.publish(topics::TASK_STARTED, &json!({"task_id": "a"}));

    assert_eq!(
        *seen.lock(),
        vec![topics::WORKFLOW_STARTED, topics::TASK_STARTED]
    );
}

// ---------------------------------------------------------------------------
// 4. Dispatch order is repeatable for a fixed registration sequence
// ---------------------------------------------------------------------------

#[test]
fn dispatch_order_is_deterministic() {
    let run = || {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (tag, priority) in [("a", 0), ("b", 5), ("c", 0), ("d", 5), ("e", -1)] {
            let order = order.clone();
            bus.subscribe(
                "evt",
                Handler::sync(move |_| {
                    order.lock().push(tag);
                    Ok(())
                }),
                priority,
            );
        }
        bus.publish("evt", &json!(null));
        let result = order.lock().clone();
        result
    };
    let first = run();
    assert_eq!(first, vec!["b", "d", "a", "c", "e"]);
    assert_eq!(first, run());
}
