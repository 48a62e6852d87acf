use crate::event::{Event, Handler, HandlerResult};
use crate::topics;
use futures_util::future::join_all;
use futures_util::FutureExt;
use maestro_core::MaestroError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default number of recent events kept for inspection.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Default)]
struct HandlerCounters {
    executions: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
}

impl HandlerCounters {
    fn record(&self, elapsed: Duration, failed: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct Registration {
    id: u64,
    priority: i32,
    handler: Handler,
    counters: HandlerCounters,
}

/// Per-handler execution statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerStats {
    pub handler_id: u64,
    pub priority: i32,
    pub is_async: bool,
    pub execution_count: u64,
    pub error_count: u64,
    pub total_execution_time_ms: f64,
    pub average_execution_time_ms: f64,
    /// `error_count / execution_count`, 0 when never executed.
    pub error_rate: f64,
}

/// In-process publish/subscribe dispatcher.
///
/// Handlers fire highest priority first; equal priorities fire in
/// registration order, including across `"*"` and type-specific subscriptions.
/// A failing handler is logged and counted, and dispatch continues with the
/// next one. Panicking handlers get the same treatment only when panics unwind:
/// under `panic = "abort"` (the workspace release profile) a handler panic
/// aborts the process.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Arc<Registration>>>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus that remembers at most `capacity` recent events (0 disables history).
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            history_capacity: capacity,
        }
    }

    /// Register `handler` for `event_type` (`"*"` for all events). Returns its id.
    pub fn subscribe(&self, event_type: &str, handler: Handler, priority: i32) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            id,
            priority,
            handler,
            counters: HandlerCounters::default(),
        });
        self.handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(registration);
        debug!(event_type, handler_id = id, priority, "Handler subscribed");
        id
    }

    /// Remove the first registration of `handler` under `event_type`.
    pub fn unsubscribe(&self, event_type: &str, handler: &Handler) -> bool {
        self.remove_where(event_type, |reg| reg.handler.same_as(handler))
    }

    pub fn unsubscribe_by_id(&self, event_type: &str, handler_id: u64) -> bool {
        self.remove_where(event_type, |reg| reg.id == handler_id)
    }

    fn remove_where<F>(&self, event_type: &str, pred: F) -> bool
    where
        F: Fn(&Registration) -> bool,
    {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };
        let Some(pos) = list.iter().position(|reg| pred(reg)) else {
            return false;
        };
        let removed = list.remove(pos);
        if list.is_empty() {
            handlers.remove(event_type);
        }
        debug!(event_type, handler_id = removed.id, "Handler unsubscribed");
        true
    }

    /// Total registrations across all event types.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// Drop every subscription and the event history.
    pub fn clear(&self) {
        self.handlers.write().clear();
        self.history.lock().clear();
    }

    /// Matching registrations in dispatch order.
    fn matching(&self, event_type: &str) -> Vec<Arc<Registration>> {
        let handlers = self.handlers.read();
        let mut regs: Vec<Arc<Registration>> = handlers
            .get(event_type)
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        if event_type != topics::ALL {
            regs.extend(handlers.get(topics::ALL).into_iter().flatten().cloned());
        }
        regs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        regs
    }

    fn remember(&self, event: &Event) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    /// Deliver to synchronous handlers only. Returns how many handlers ran.
    pub fn publish(&self, event_type: &str, data: &Value) -> usize {
        let event = Event::new(event_type, data);
        self.remember(&event);
        let regs = self.matching(event_type);
        let invoked = dispatch_sync(&regs, &event);
        debug!(event_type, handlers = invoked, "Event published");
        invoked
    }

    /// Deliver to synchronous handlers (same order as [`EventBus::publish`]), then run
    /// every async handler concurrently and wait for all of them.
    pub async fn publish_async(&self, event_type: &str, data: &Value) -> usize {
        let event = Event::new(event_type, data);
        self.remember(&event);
        let regs = self.matching(event_type);
        let mut invoked = dispatch_sync(&regs, &event);

        let pending: Vec<_> = regs
            .iter()
            .filter_map(|reg| match &reg.handler {
                Handler::Async(f) => Some((reg.clone(), f.clone())),
                Handler::Sync(_) => None,
            })
            .collect();
        invoked += pending.len();

        join_all(pending.into_iter().map(|(reg, f)| {
            let event = event.clone();
            async move {
                let start = Instant::now();
                let result = match AssertUnwindSafe(f(event)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(MaestroError::Handler("async handler panicked".into())),
                };
                finish(&reg, start.elapsed(), result, event_type);
            }
        }))
        .await;

        debug!(event_type, handlers = invoked, "Event published (async)");
        invoked
    }

    /// Statistics per event type, per handler.
    pub fn handler_stats(&self) -> BTreeMap<String, Vec<HandlerStats>> {
        let handlers = self.handlers.read();
        handlers
            .iter()
            .map(|(event_type, regs)| {
                let stats = regs.iter().map(|reg| stats_of(reg)).collect();
                (event_type.clone(), stats)
            })
            .collect()
    }

    /// Most recent events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_sync(regs: &[Arc<Registration>], event: &Event) -> usize {
    let mut invoked = 0;
    for reg in regs {
        let Handler::Sync(f) = &reg.handler else {
            continue;
        };
        let start = Instant::now();
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| f(event))) {
            Ok(result) => result,
            Err(_) => Err(MaestroError::Handler("handler panicked".into())),
        };
        finish(reg, start.elapsed(), result, &event.event_type);
        invoked += 1;
    }
    invoked
}

fn finish(reg: &Registration, elapsed: Duration, result: HandlerResult, event_type: &str) {
    reg.counters.record(elapsed, result.is_err());
    if let Err(e) = result {
        warn!(event_type, handler_id = reg.id, error = %e, "Event handler failed");
    }
}

fn stats_of(reg: &Registration) -> HandlerStats {
    let executions = reg.counters.executions.load(Ordering::Relaxed);
    let errors = reg.counters.errors.load(Ordering::Relaxed);
    let total_ms = reg.counters.total_micros.load(Ordering::Relaxed) as f64 / 1000.0;
    let (average, error_rate) = if executions == 0 {
        (0.0, 0.0)
    } else {
        (total_ms / executions as f64, errors as f64 / executions as f64)
    };
    HandlerStats {
        handler_id: reg.id,
        priority: reg.priority,
        is_async: reg.handler.is_async(),
        execution_count: executions,
        error_count: errors,
        total_execution_time_ms: total_ms,
        average_execution_time_ms: average,
        error_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        let log = log.clone();
        Handler::sync(move |_| {
            log.lock().push(tag.to_string());
            Ok(())
        })
    }

    #[test]
    fn test_subscribe_returns_increasing_ids() {
        let bus = EventBus::new();
        let a = bus.subscribe("x", Handler::sync(|_| Ok(())), 0);
        let b = bus.subscribe("y", Handler::sync(|_| Ok(())), 0);
        assert!(b > a);
        assert_eq!(bus.handler_count(), 2);
    }

    #[test]
    fn test_priority_then_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("x", recorder(&log, "low"), 1);
        bus.subscribe("x", recorder(&log, "high-1"), 10);
        bus.subscribe(topics::ALL, recorder(&log, "wildcard-high"), 10);
        bus.subscribe("x", recorder(&log, "high-2"), 10);

        assert_eq!(bus.publish("x", &json!({})), 4);
        assert_eq!(
            *log.lock(),
            vec!["high-1", "wildcard-high", "high-2", "low"]
        );
    }

    #[test]
    fn test_publish_skips_async_handlers() {
        let bus = EventBus::new();
        bus.subscribe("x", Handler::from_async(|_| async { Ok(()) }), 0);
        bus.subscribe("x", Handler::sync(|_| Ok(())), 0);
        assert_eq!(bus.publish("x", &json!({})), 1);
    }

    #[test]
    fn test_failing_handler_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("x", recorder(&log, "first"), 5);
        let failing = bus.subscribe(
            "x",
            Handler::sync(|_| Err(MaestroError::Handler("nope".into()))),
            4,
        );
        bus.subscribe("x", recorder(&log, "last"), 2);

        assert_eq!(bus.publish("x", &json!({})), 3);
        assert_eq!(*log.lock(), vec!["first", "last"]);

        let stats = bus.handler_stats();
        let failing_stats = stats["x"].iter().find(|s| s.handler_id == failing).unwrap();
        assert_eq!(failing_stats.error_count, 1);
        assert_eq!(failing_stats.execution_count, 1);
        assert!((failing_stats.error_rate - 1.0).abs() < f64::EPSILON);
    }

    // Only meaningful when panics unwind; the release profile aborts instead.
    #[cfg(panic = "unwind")]
    #[test]
    fn test_panicking_handler_is_counted_as_error() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let panicking = bus.subscribe("x", Handler::sync(|_| panic!("handler bug")), 3);
        bus.subscribe("x", recorder(&log, "after"), 2);

        assert_eq!(bus.publish("x", &json!({})), 2);
        assert_eq!(*log.lock(), vec!["after"]);
        let stats = bus.handler_stats();
        let panicking_stats = stats["x"].iter().find(|s| s.handler_id == panicking).unwrap();
        assert_eq!(panicking_stats.error_count, 1);
    }

    #[test]
    fn test_unsubscribe_by_handler_and_id() {
        let bus = EventBus::new();
        let handler = Handler::sync(|_| Ok(()));
        bus.subscribe("x", handler.clone(), 0);
        let id = bus.subscribe("y", Handler::sync(|_| Ok(())), 0);

        assert!(bus.unsubscribe("x", &handler));
        assert!(!bus.unsubscribe("x", &handler));
        assert!(!bus.unsubscribe_by_id("x", id));
        assert!(bus.unsubscribe_by_id("y", id));
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_payload_is_not_mutated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        bus.subscribe(
            "x",
            Handler::sync(move |event| {
                *seen_clone.lock() = event.get_str("_eventType").map(str::to_string);
                Ok(())
            }),
            0,
        );
        let data = json!({"k": 1});
        bus.publish("x", &data);
        assert_eq!(data, json!({"k": 1}));
        assert_eq!(seen.lock().as_deref(), Some("x"));
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::with_history_capacity(2);
        bus.publish("a", &json!({}));
        bus.publish("b", &json!({}));
        bus.publish("c", &json!({}));
        let recent = bus.recent_events(10);
        let types: Vec<&str> = recent.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["b", "c"]);
        assert_eq!(bus.recent_events(1)[0].event_type, "c");
    }

    #[tokio::test]
    async fn test_publish_async_runs_sync_then_async() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let async_log = log.clone();
        bus.subscribe(
            "x",
            Handler::from_async(move |_| {
                let log = async_log.clone();
                async move {
                    log.lock().push("async".to_string());
                    Ok(())
                }
            }),
            100,
        );
        bus.subscribe("x", recorder(&log, "sync"), 0);

        assert_eq!(bus.publish_async("x", &json!({})).await, 2);
        assert_eq!(*log.lock(), vec!["sync", "async"]);
    }
}
