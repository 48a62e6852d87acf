use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

/// Role a task asks for; selects the candidate agents.
///
/// Serialized as its lowercase name so it can key TOML/JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentRole {
    /// Reads inputs and produces findings.
    Analyzer,
    /// Turns findings into an artifact.
    Implementer,
    /// Improves an existing artifact.
    Refiner,
    /// Checks an artifact and reports on it.
    Reviewer,
    /// Any role not covered above.
    Custom(String),
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Analyzer => write!(f, "analyzer"),
            AgentRole::Implementer => write!(f, "implementer"),
            AgentRole::Refiner => write!(f, "refiner"),
            AgentRole::Reviewer => write!(f, "reviewer"),
            AgentRole::Custom(name) => write!(f, "{name}"),
        }
    }
}

impl From<&str> for AgentRole {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "analyzer" => AgentRole::Analyzer,
            "implementer" => AgentRole::Implementer,
            "refiner" => AgentRole::Refiner,
            "reviewer" => AgentRole::Reviewer,
            _ => AgentRole::Custom(value.to_string()),
        }
    }
}

impl From<String> for AgentRole {
    fn from(value: String) -> Self {
        AgentRole::from(value.as_str())
    }
}

impl From<AgentRole> for String {
    fn from(role: AgentRole) -> Self {
        role.to_string()
    }
}

/// Scheduling priority. Earlier variants sort first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Per-task timeout, in milliseconds.
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// When set, a cached outcome under this key short-circuits execution.
    #[serde(default)]
    pub cache_key: Option<String>,
    /// Agent to try before falling back to role-based selection.
    #[serde(default)]
    pub preferred_agent: Option<String>,
}

impl TaskDefinition {
    /// Default timeout for tasks built with [`TaskDefinition::new`].
    pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
    /// Default retry budget for tasks built with [`TaskDefinition::new`].
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(id: impl Into<String>, name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            inputs: HashMap::new(),
            dependencies: BTreeSet::new(),
            priority: Priority::Normal,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            cache_key: None,
            preferred_agent: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_preferred_agent(mut self, agent: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// True when every dependency is in `completed`.
    pub fn is_ready<F>(&self, mut completed: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        self.dependencies.iter().all(|dep| completed(dep))
    }
}

/// Successful result of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    /// Name of the agent that produced the output.
    pub agent: String,
    pub output: serde_json::Value,
    pub attempts: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Per-task lifecycle state inside one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Completed from the result cache without an agent call.
    Cached,
    Failed {
        reason: String,
    },
    /// Never started because a prerequisite did not succeed.
    DependencyFailed {
        dependency: String,
    },
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cached)
    }
}
