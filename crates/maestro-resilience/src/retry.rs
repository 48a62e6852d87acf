use crate::circuit_breaker::CircuitBreakerRegistry;
use maestro_core::{ErrorKind, MaestroError, MaestroResult};
use maestro_events::{topics, EventBus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How delays between attempts are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry with no delay.
    Immediate,
    /// `initial_delay * attempt`.
    LinearBackoff,
    /// `min(initial_delay * factor^(attempt - 1), max_delay)`.
    #[default]
    ExponentialBackoff,
    /// Exponential delays, with every attempt routed through a named circuit breaker.
    CircuitBreakerGuarded,
}

/// Attempt sequencing for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Total attempts including the first. `1` disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Error kinds worth another attempt. Anything else propagates immediately.
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorKind>,
    /// Breaker every attempt goes through, looked up in the executor's registry.
    #[serde(default)]
    pub circuit_breaker: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_retryable() -> Vec<ErrorKind> {
    ErrorKind::DEFAULT_RETRYABLE.to_vec()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            retryable: default_retryable(),
            circuit_breaker: None,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Immediate,
            max_attempts,
            initial_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn with_circuit_breaker(mut self, name: impl Into<String>) -> Self {
        self.circuit_breaker = Some(name.into());
        self
    }

    pub fn is_retryable(&self, err: &MaestroError) -> bool {
        self.retryable.contains(&err.kind())
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self.strategy {
            RetryStrategy::Immediate => 0,
            RetryStrategy::LinearBackoff => self.initial_delay_ms.saturating_mul(u64::from(attempt)),
            RetryStrategy::ExponentialBackoff | RetryStrategy::CircuitBreakerGuarded => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let raw = self.initial_delay_ms as f64 * self.backoff_factor.powi(exp);
                if raw.is_finite() {
                    (raw as u64).min(self.max_delay_ms)
                } else {
                    self.max_delay_ms
                }
            }
        };
        Duration::from_millis(ms)
    }
}

/// Identifiers attached to every retry event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    pub workflow_id: String,
    pub task_id: String,
    /// What is being retried, e.g. the agent name.
    pub operation: String,
}

impl RetryContext {
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            operation: operation.into(),
        }
    }
}

/// Runs operations under a [`RetryPolicy`], reporting each step to the event bus.
#[derive(Clone, Default)]
pub struct RetryExecutor {
    events: Option<Arc<EventBus>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Call `op(attempt)` until it succeeds, fails with a non-retryable error,
    /// or `policy.max_attempts` is reached.
    ///
    /// A non-retryable error is returned as is. A retryable error on the last
    /// attempt is wrapped in [`MaestroError::RetryExhausted`].
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut op: F,
        policy: &RetryPolicy,
        ctx: &RetryContext,
    ) -> MaestroResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = MaestroResult<T>>,
    {
        let breaker = match (&policy.circuit_breaker, self.breakers.as_ref()) {
            (Some(name), Some(registry)) => Some(registry.get_or_create(name)),
            (Some(name), None) => {
                return Err(MaestroError::Config(format!(
                    "retry policy names circuit breaker '{name}' but no registry is configured"
                )))
            }
            (None, _) if policy.strategy == RetryStrategy::CircuitBreakerGuarded => {
                return Err(MaestroError::Config(
                    "circuit_breaker_guarded strategy requires a breaker name".into(),
                ))
            }
            (None, _) => None,
        };
        let max_attempts = policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            self.report(
                topics::RETRY_ATTEMPT,
                ctx,
                json!({ "attempt": attempt, "max_attempts": max_attempts }),
            )
            .await;

            let result = match &breaker {
                Some(breaker) => breaker.call(|| op(attempt)).await,
                None => op(attempt).await,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(task_id = %ctx.task_id, operation = %ctx.operation, attempt, "Succeeded after retry");
                    }
                    self.report(topics::RETRY_SUCCESS, ctx, json!({ "attempt": attempt }))
                        .await;
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !policy.is_retryable(&err) {
                warn!(
                    task_id = %ctx.task_id,
                    operation = %ctx.operation,
                    attempt,
                    error = %err,
                    "Non-retryable error, giving up"
                );
                self.report(
                    topics::RETRY_ABORTED,
                    ctx,
                    json!({ "attempt": attempt, "error": err.to_string(), "kind": err.kind() }),
                )
                .await;
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(
                    task_id = %ctx.task_id,
                    operation = %ctx.operation,
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                self.report(
                    topics::RETRY_EXHAUSTED,
                    ctx,
                    json!({ "attempts": attempt, "error": err.to_string(), "kind": err.kind() }),
                )
                .await;
                return Err(MaestroError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = policy.delay_for(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(
                task_id = %ctx.task_id,
                operation = %ctx.operation,
                attempt,
                delay_ms,
                error = %err,
                "Retryable error, backing off"
            );
            self.report(
                topics::RETRY_DELAY,
                ctx,
                json!({ "attempt": attempt, "delay_ms": delay_ms, "error": err.to_string() }),
            )
            .await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    async fn report(&self, topic: &str, ctx: &RetryContext, mut data: serde_json::Value) {
        debug!(topic, task_id = %ctx.task_id, "Retry event");
        let Some(events) = &self.events else {
            return;
        };
        if let Some(map) = data.as_object_mut() {
            map.insert("workflow_id".into(), json!(ctx.workflow_id));
            map.insert("task_id".into(), json!(ctx.task_id));
            map.insert("operation".into(), json!(ctx.operation));
        }
        events.publish_async(topic, &data).await;
    }
}
