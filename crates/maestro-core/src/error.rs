use serde::{Deserialize, Serialize};
use std::fmt;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the orchestration core.
///
/// Per-task variants are contained by the scheduler and recorded into the
/// workflow context; structural variants abort a run before any task starts.
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    /// A prerequisite task did not complete successfully.
    #[error("dependency '{dependency}' of task '{task_id}' did not succeed")]
    DependencyFailed {
        /// The task that was never started.
        task_id: String,
        /// The failed prerequisite.
        dependency: String,
    },

    /// The task exceeded its own timeout.
    #[error("task '{task_id}' timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// The task that timed out.
        task_id: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The circuit breaker for the target is open; the call was not attempted.
    #[error("circuit breaker for '{target}' is open")]
    CircuitOpen {
        /// Breaker (target) name.
        target: String,
    },

    /// No healthy agent exists for the requested role.
    #[error("no healthy agent available for role '{role}'")]
    NoAgentAvailable {
        /// The requested role.
        role: String,
    },

    /// Retries were exhausted; wraps the last underlying error.
    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error returned by the final attempt.
        last: Box<MaestroError>,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Task ids forming the cycle, first id repeated at the end.
        cycle: Vec<String>,
    },

    /// Tasks remain pending but none can ever become ready.
    #[error("unschedulable workflow: pending tasks [{}] can never become ready", pending.join(", "))]
    Unschedulable {
        /// Task ids left pending.
        pending: Vec<String>,
    },

    /// Two tasks in one workflow share an id.
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),

    /// A task declares a dependency that is not part of the workflow.
    #[error("task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        /// The declaring task.
        task_id: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// A workflow context in a terminal state was asked to run again.
    #[error("workflow '{0}' already reached a terminal state")]
    WorkflowTerminal(String),

    /// A per-task failure wrapped with its identifiers.
    #[error("task '{task_id}' in workflow '{workflow_id}' failed: {source}")]
    TaskFailed {
        /// Owning workflow.
        workflow_id: String,
        /// Failing task.
        task_id: String,
        /// Underlying cause.
        source: Box<MaestroError>,
    },

    /// A transport-level failure reported by an agent.
    #[error("network error: {0}")]
    Network(String),

    /// An agent-side timeout (distinct from the scheduler's task timeout).
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote side asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The remote side is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The task inputs did not match what the agent expects.
    #[error("validation error: {0}")]
    Validation(String),

    /// Any other agent failure.
    #[error("agent error: {0}")]
    Agent(String),

    /// The durable sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// An event handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`MaestroError`], used by retry allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DependencyFailed,
    TaskTimeout,
    CircuitOpen,
    NoAgentAvailable,
    RetryExhausted,
    Structural,
    Network,
    Timeout,
    RateLimited,
    Unavailable,
    Validation,
    Agent,
    Sink,
    Handler,
    Config,
    Serialization,
    Io,
}

impl ErrorKind {
    /// Kinds retried when no explicit allow-list is configured.
    pub const DEFAULT_RETRYABLE: [ErrorKind; 4] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::RateLimited,
        ErrorKind::Unavailable,
    ];
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NoAgentAvailable => "no_agent_available",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Structural => "structural",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Validation => "validation",
            ErrorKind::Agent => "agent",
            ErrorKind::Sink => "sink",
            ErrorKind::Handler => "handler",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

impl MaestroError {
    /// Classify this error. `TaskFailed` reports the kind of its cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MaestroError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            MaestroError::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            MaestroError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            MaestroError::NoAgentAvailable { .. } => ErrorKind::NoAgentAvailable,
            MaestroError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            MaestroError::CyclicDependency { .. }
            | MaestroError::Unschedulable { .. }
            | MaestroError::DuplicateTask(_)
            | MaestroError::UnknownDependency { .. }
            | MaestroError::WorkflowTerminal(_) => ErrorKind::Structural,
            MaestroError::TaskFailed { source, .. } => source.kind(),
            MaestroError::Network(_) => ErrorKind::Network,
            MaestroError::Timeout(_) => ErrorKind::Timeout,
            MaestroError::RateLimited(_) => ErrorKind::RateLimited,
            MaestroError::Unavailable(_) => ErrorKind::Unavailable,
            MaestroError::Validation(_) => ErrorKind::Validation,
            MaestroError::Agent(_) => ErrorKind::Agent,
            MaestroError::Sink(_) => ErrorKind::Sink,
            MaestroError::Handler(_) => ErrorKind::Handler,
            MaestroError::Config(_) => ErrorKind::Config,
            MaestroError::Json(_) => ErrorKind::Serialization,
            MaestroError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this error aborts an entire workflow run.
    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::Structural
    }

    /// Wrap this error with the workflow and task it belongs to.
    pub fn for_task(self, workflow_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        MaestroError::TaskFailed {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            source: Box::new(self),
        }
    }

    /// Strip any `TaskFailed` / `RetryExhausted` wrappers.
    pub fn root_cause(&self) -> &MaestroError {
        match self {
            MaestroError::TaskFailed { source, .. } => source.root_cause(),
            MaestroError::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}
