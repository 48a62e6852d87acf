use maestro_core::{AgentRole, ErrorKind, MaestroError, MaestroResult, TaskDefinition};
use maestro_events::{EventBus, DEFAULT_HISTORY_CAPACITY};
use maestro_resilience::{CircuitBreakerConfig, RetryPolicy, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// How the scheduler picks among queued ready tasks when a slot frees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreakPolicy {
    /// FIFO: tasks launch in the order they became ready, each batch sorted by priority.
    #[default]
    #[serde(rename = "static")]
    StaticOrder,
    /// A newly ready higher-priority task jumps ahead of queued lower-priority ones.
    #[serde(rename = "priority")]
    PriorityPreemptive,
}

/// Backoff parameters shared by every task; the attempt count comes from the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: RetryStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            retryable: default_retryable(),
        }
    }
}

impl RetryConfig {
    /// Policy for one task making at most `max_attempts` attempts.
    pub fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            strategy: self.strategy,
            max_attempts: max_attempts.max(1),
            initial_delay_ms: self.initial_delay_ms,
            backoff_factor: self.backoff_factor,
            max_delay_ms: self.max_delay_ms,
            retryable: self.retryable.clone(),
            circuit_breaker: None,
        }
    }
}

/// Everything the scheduler and coordinator read at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Agent names per role, most preferred first. Unlisted agents follow in
    /// registration order.
    #[serde(default)]
    pub agent_preferences: BTreeMap<AgentRole, Vec<String>>,
    #[serde(default)]
    pub tie_break: TieBreakPolicy,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

fn default_max_parallel_tasks() -> usize {
    4
}
fn default_max_retries() -> u32 {
    TaskDefinition::DEFAULT_MAX_RETRIES
}
fn default_timeout_ms() -> u64 {
    TaskDefinition::DEFAULT_TIMEOUT_MS
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
fn default_event_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            default_max_retries: default_max_retries(),
            default_timeout_ms: default_timeout_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            agent_preferences: BTreeMap::new(),
            tie_break: TieBreakPolicy::default(),
            event_history_capacity: default_event_history_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> MaestroResult<Self> {
        let config: OrchestratorConfig = toml::from_str(content)
            .map_err(|e| MaestroError::Config(format!("invalid orchestrator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> MaestroResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            max_parallel_tasks = config.max_parallel_tasks,
            "Orchestrator config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> MaestroResult<()> {
        if self.max_parallel_tasks == 0 {
            return Err(MaestroError::Config("max_parallel_tasks must be at least 1".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(MaestroError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(MaestroError::Config(
                "circuit_breaker.half_open_max_calls must be at least 1".into(),
            ));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 0.0 {
            return Err(MaestroError::Config(format!(
                "retry.backoff_factor must be a finite non-negative number, got {}",
                self.retry.backoff_factor
            )));
        }
        Ok(())
    }

    /// A task carrying the configured default timeout and retry count.
    pub fn task(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
    ) -> TaskDefinition {
        TaskDefinition::new(id, name, role)
            .with_timeout(Duration::from_millis(self.default_timeout_ms))
            .with_max_retries(self.default_max_retries)
    }

    /// Event bus sized by `event_history_capacity`.
    pub fn event_bus(&self) -> EventBus {
        EventBus::with_history_capacity(self.event_history_capacity)
    }

    /// Preference rank of `agent` within `role`, `None` when unlisted.
    pub fn preference_rank(&self, role: &AgentRole, agent: &str) -> Option<usize> {
        self.agent_preferences
            .get(role)
            .and_then(|names| names.iter().position(|n| n == agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_parallel_tasks, 4);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.tie_break, TieBreakPolicy::StaticOrder);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
max_parallel_tasks = 2
tie_break = "priority"

[circuit_breaker]
failure_threshold = 3
recovery_timeout_ms = 5000

[retry]
strategy = "linear_backoff"
initial_delay_ms = 250
retryable = ["network", "rate_limited"]

[agent_preferences]
analyzer = ["fast", "thorough"]
"#,
        )
        .unwrap();

        assert_eq!(config.max_parallel_tasks, 2);
        assert_eq!(config.tie_break, TieBreakPolicy::PriorityPreemptive);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.half_open_max_calls, 1);
        assert_eq!(config.retry.strategy, RetryStrategy::LinearBackoff);
        assert_eq!(
            config.retry.retryable,
            vec![ErrorKind::Network, ErrorKind::RateLimited]
        );
        assert_eq!(config.preference_rank(&AgentRole::Analyzer, "thorough"), Some(1));
        assert_eq!(config.preference_rank(&AgentRole::Analyzer, "other"), None);
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let err = OrchestratorConfig::from_toml_str("max_parallel_tasks = 0").unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_negative_backoff() {
        let config = OrchestratorConfig {
            retry: RetryConfig {
                backoff_factor: -1.0,
                ..RetryConfig::default()
            },
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_clamps_attempts() {
        let policy = RetryConfig::default().policy(0);
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.circuit_breaker.is_none());
    }

    #[test]
    fn test_task_uses_configured_defaults() {
        let config = OrchestratorConfig {
            default_max_retries: 7,
            default_timeout_ms: 1_500,
            ..OrchestratorConfig::default()
        };
        let task = config.task("a", "A", AgentRole::Refiner);
        assert_eq!(task.max_retries, 7);
        assert_eq!(task.timeout_ms, 1_500);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maestro.toml");
        tokio::fs::write(&path, "max_parallel_tasks = 8\n").await.unwrap();
        let config = OrchestratorConfig::load(&path).await.unwrap();
        assert_eq!(config.max_parallel_tasks, 8);

        let missing = OrchestratorConfig::load(dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(MaestroError::Io(_))));
    }
}
