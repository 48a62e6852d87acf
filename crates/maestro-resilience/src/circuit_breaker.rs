use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use maestro_events::{topics, EventBus};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Thresholds for one circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures (net of successes) that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown before an open circuit admits a probe.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Probe calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    60_000
}
fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Operational mode of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; every call goes through.
    Closed,
    /// Failing fast; calls are rejected without reaching the target.
    Open,
    /// Testing recovery with a limited number of probes.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker, for dashboards and agent selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub half_open_probes_used: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    reason: &'static str,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_probes_used: u32,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_at: None,
            half_open_probes_used: 0,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn move_to(&mut self, to: CircuitState, reason: &'static str, log: &mut Vec<Transition>) {
        if self.state == to {
            return;
        }
        log.push(Transition {
            from: self.state,
            to,
            reason,
        });
        if self.state == CircuitState::HalfOpen || to == CircuitState::HalfOpen {
            self.half_open_probes_used = 0;
        }
        self.state = to;
    }

    fn recovery_elapsed(&self, recovery: Duration) -> bool {
        self.last_failure
            .map_or(true, |at| at.elapsed() > recovery)
    }

    fn note_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
    }
}

/// Fault-isolation state machine around calls to one target.
///
/// `Closed -> Open` once `failure_count` reaches the threshold; `Open -> HalfOpen`
/// on the first call after the recovery timeout; `HalfOpen -> Closed` on a
/// successful probe and `HalfOpen -> Open` on a failed probe or when the probe
/// budget is spent. Admission and result recording each run under one lock,
/// so concurrent calls never interleave a read-modify-write of the state.
/// The wrapped future itself runs outside the lock.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout_ms,
            half_open_max_calls = config.half_open_max_calls,
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
            events: None,
        }
    }

    /// Publish every state transition to `events`.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without side effects.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call made now would be admitted. Does not change state.
    pub fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.recovery_elapsed(self.config.recovery_timeout()),
            CircuitState::HalfOpen => inner.half_open_probes_used < self.config.half_open_max_calls,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            half_open_probes_used: inner.half_open_probes_used,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Force the breaker back to `Closed` with a clean slate.
    pub async fn reset(&self) {
        let mut log = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.move_to(CircuitState::Closed, "manual reset", &mut log);
            inner.failure_count = 0;
            inner.last_failure = None;
            inner.half_open_probes_used = 0;
        }
        self.report(log).await;
    }

    /// Run `op` under breaker protection.
    ///
    /// Returns the operation's result, re-raises its error after recording it,
    /// or fails with [`MaestroError::CircuitOpen`] without invoking `op`.
    pub async fn call<F, Fut, T>(&self, op: F) -> MaestroResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MaestroResult<T>>,
    {
        let mut log = Vec::new();
        let admitted_in = self.admit(&mut log);
        self.report(std::mem::take(&mut log)).await;

        let Some(admitted_in) = admitted_in else {
            debug!(breaker = %self.name, "Call rejected: circuit open");
            return Err(MaestroError::CircuitOpen {
                target: self.name.clone(),
            });
        };

        let result = op().await;
        self.record(admitted_in, result.is_ok(), &mut log);
        self.report(log).await;
        result
    }

    /// Admission step. `Some(state)` is the state the call was admitted in.
    fn admit(&self, log: &mut Vec<Transition>) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if inner.recovery_elapsed(self.config.recovery_timeout()) {
                inner.move_to(CircuitState::HalfOpen, "recovery timeout elapsed", log);
            } else {
                inner.rejected_calls += 1;
                return None;
            }
        }
        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_probes_used >= self.config.half_open_max_calls {
                if inner.failure_count > 0 {
                    inner.move_to(CircuitState::Open, "half-open probe budget exhausted", log);
                    inner.last_failure = Some(Instant::now());
                }
                inner.rejected_calls += 1;
                return None;
            }
            inner.half_open_probes_used += 1;
        }
        inner.total_calls += 1;
        Some(inner.state)
    }

    /// Result step. A result that comes back after the state moved on since
    /// admission (a probe outliving its half-open window) only updates counters.
    fn record(&self, admitted_in: CircuitState, success: bool, log: &mut Vec<Transition>) {
        let mut inner = self.inner.lock();
        if success {
            match (admitted_in, inner.state) {
                (CircuitState::HalfOpen, CircuitState::HalfOpen) => {
                    inner.failure_count = 0;
                    inner.move_to(CircuitState::Closed, "probe succeeded", log);
                }
                (_, CircuitState::Closed) => {
                    inner.failure_count = inner.failure_count.saturating_sub(1);
                }
                _ => {}
            }
            return;
        }

        inner.total_failures += 1;
        inner.note_failure();
        match (admitted_in, inner.state) {
            (CircuitState::HalfOpen, CircuitState::HalfOpen) => {
                inner.move_to(CircuitState::Open, "probe failed", log);
            }
            (_, CircuitState::Closed) if inner.failure_count >= self.config.failure_threshold => {
                inner.move_to(CircuitState::Open, "failure threshold reached", log);
            }
            _ => {}
        }
    }

    async fn report(&self, log: Vec<Transition>) {
        for t in log {
            match t.to {
                CircuitState::Open => warn!(
                    breaker = %self.name,
                    from = %t.from,
                    reason = t.reason,
                    "Circuit breaker opened"
                ),
                _ => info!(
                    breaker = %self.name,
                    from = %t.from,
                    to = %t.to,
                    reason = t.reason,
                    "Circuit breaker state change"
                ),
            }
            if let Some(events) = &self.events {
                events
                    .publish_async(
                        topics::CIRCUIT_STATE_CHANGE,
                        &json!({
                            "breaker": self.name,
                            "previous_state": t.from,
                            "new_state": t.to,
                            "reason": t.reason,
                        }),
                    )
                    .await;
            }
        }
    }
}

/// Breakers keyed by target name, created on first use and kept for the
/// lifetime of the registry.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    events: Option<Arc<EventBus>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            events: None,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(name, self.config.clone());
                let breaker = match &self.events {
                    Some(events) => breaker.with_event_bus(events.clone()),
                    None => breaker,
                };
                Arc::new(breaker)
            })
            .clone()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
