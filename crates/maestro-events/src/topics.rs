//! Lifecycle event names published by the orchestration core.

/// Subscribe to every event type.
pub const ALL: &str = "*";

pub const WORKFLOW_STARTED: &str = "workflow.started";
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
pub const WORKFLOW_FAILED: &str = "workflow.failed";

pub const TASK_STARTED: &str = "task.started";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_CACHE_HIT: &str = "task.cache_hit";
pub const TASK_CHECKPOINT: &str = "task.checkpoint";

pub const RETRY_ATTEMPT: &str = "retry.attempt";
pub const RETRY_DELAY: &str = "retry.delay";
pub const RETRY_SUCCESS: &str = "retry.success";
/// A retryable error persisted through the last attempt.
pub const RETRY_EXHAUSTED: &str = "retry.exhausted";
/// A non-retryable error stopped the retry loop early.
pub const RETRY_ABORTED: &str = "retry.aborted";

pub const CIRCUIT_STATE_CHANGE: &str = "circuit_breaker.state_change";
