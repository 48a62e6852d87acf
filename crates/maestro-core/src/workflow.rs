use crate::error::{MaestroError, MaestroResult};
use crate::task::{TaskDefinition, TaskOutcome, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// One user-requested set of interdependent tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
}

impl Workflow {
    /// Create a workflow with a generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name)
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Add a task (builder style).
    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn add_task(&mut self, task: TaskDefinition) {
        self.tasks.push(task);
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Reject duplicate task ids and dependencies on tasks outside the workflow.
    ///
    /// Cycle detection lives with the scheduler's task graph.
    pub fn validate(&self) -> MaestroResult<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(MaestroError::DuplicateTask(task.id.clone()));
            }
        }
        for task in &self.tasks {
            if let Some(missing) = task.dependencies.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(MaestroError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// A progress marker appended every time a task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: TaskStatus,
}

/// Aggregate performance figures computed when a run finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub wall_clock_ms: u64,
    /// Sum of individual task durations: the cost of running them one by one.
    pub sequential_estimate_ms: u64,
    pub tasks_per_second: f64,
    /// `sequential_estimate_ms / wall_clock_ms`.
    pub parallel_speedup: f64,
    /// Speedup divided by the concurrency ceiling, in `[0, 1]` for honest runs.
    pub parallel_efficiency: f64,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub cache_hits: usize,
}

impl WorkflowMetrics {
    /// Derive the ratios from raw timings.
    pub fn compute(
        wall_clock_ms: u64,
        sequential_estimate_ms: u64,
        max_parallel: usize,
        tasks_completed: usize,
        tasks_failed: usize,
        cache_hits: usize,
    ) -> Self {
        let finished = tasks_completed + tasks_failed;
        let wall_secs = wall_clock_ms as f64 / 1000.0;
        let tasks_per_second = if wall_secs > 0.0 {
            finished as f64 / wall_secs
        } else {
            0.0
        };
        let parallel_speedup = if wall_clock_ms > 0 {
            sequential_estimate_ms as f64 / wall_clock_ms as f64
        } else {
            1.0
        };
        let parallel_efficiency = parallel_speedup / max_parallel.max(1) as f64;
        Self {
            wall_clock_ms,
            sequential_estimate_ms,
            tasks_per_second,
            parallel_speedup,
            parallel_efficiency,
            tasks_completed,
            tasks_failed,
            cache_hits,
        }
    }
}

/// Mutable aggregate owned by exactly one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Successful outcomes, keyed by task id.
    pub results: HashMap<String, TaskOutcome>,
    /// One entry per failed task, prefixed with the task id.
    pub errors: Vec<String>,
    pub checkpoints: Vec<Checkpoint>,
    /// Outcomes keyed by task cache key.
    pub cache: HashMap<String, TaskOutcome>,
    pub task_status: HashMap<String, TaskStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: Option<WorkflowMetrics>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Pending,
            results: HashMap::new(),
            errors: Vec::new(),
            checkpoints: Vec::new(),
            cache: HashMap::new(),
            task_status: HashMap::new(),
            started_at: None,
            finished_at: None,
            metrics: None,
        }
    }

    /// Seed the context with previously cached outcomes.
    pub fn with_cache(mut self, cache: HashMap<String, TaskOutcome>) -> Self {
        self.cache = cache;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `Pending -> Running`. Terminal contexts never move again.
    pub fn start(&mut self) -> MaestroResult<()> {
        if self.is_terminal() {
            return Err(MaestroError::WorkflowTerminal(self.workflow_id.clone()));
        }
        self.status = WorkflowStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Completed | Failed`, decided by whether any error was recorded.
    pub fn finish(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = if self.errors.is_empty() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        self.finished_at = Some(Utc::now());
    }

    /// Cached outcome for a task, if it has a cache key with a stored entry.
    pub fn cached(&self, task: &TaskDefinition) -> Option<&TaskOutcome> {
        task.cache_key.as_ref().and_then(|key| self.cache.get(key))
    }

    pub fn status_of(&self, task_id: &str) -> Option<&TaskStatus> {
        self.task_status.get(task_id)
    }

    /// True when the task completed successfully in this run.
    pub fn succeeded(&self, task_id: &str) -> bool {
        self.results.contains_key(task_id)
    }

    pub fn mark_running(&mut self, task_id: &str) {
        self.task_status
            .insert(task_id.to_string(), TaskStatus::Running);
    }

    /// Record a successful outcome, store it under the task's cache key, and checkpoint.
    pub fn record_success(&mut self, task: &TaskDefinition, outcome: TaskOutcome, cached: bool) {
        let status = if cached {
            TaskStatus::Cached
        } else {
            TaskStatus::Completed
        };
        if let Some(key) = &task.cache_key {
            self.cache.insert(key.clone(), outcome.clone());
        }
        self.results.insert(task.id.clone(), outcome);
        self.checkpoint(&task.id, status);
    }

    /// Record a failure: status, a task-prefixed error line, and a checkpoint.
    pub fn record_failure(&mut self, task_id: &str, status: TaskStatus, error: &MaestroError) {
        self.errors.push(format!("{task_id}: {error}"));
        self.checkpoint(task_id, status);
    }

    fn checkpoint(&mut self, task_id: &str, status: TaskStatus) {
        self.task_status.insert(task_id.to_string(), status.clone());
        self.checkpoints.push(Checkpoint {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            status,
        });
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let failed = self
            .task_status
            .values()
            .filter(|s| s.is_terminal() && !s.is_success())
            .count();
        format!(
            "Workflow {} {:?}: {} task(s) succeeded, {} failed, {} error(s)",
            self.workflow_id,
            self.status,
            self.results.len(),
            failed,
            self.errors.len()
        )
    }

    /// Serialize the context as JSON (for reports and dashboards).
    pub fn to_json(&self) -> MaestroResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AgentRole;
    use serde_json::json;

    fn outcome(task_id: &str) -> TaskOutcome {
        TaskOutcome {
            task_id: task_id.to_string(),
            agent: "mock".to_string(),
            output: json!({"ok": true}),
            attempts: 1,
            duration_ms: 10,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let wf = Workflow::with_id("wf", "dup")
            .task(TaskDefinition::new("a", "A", AgentRole::Analyzer))
            .task(TaskDefinition::new("a", "A again", AgentRole::Analyzer));
        assert!(matches!(wf.validate(), Err(MaestroError::DuplicateTask(id)) if id == "a"));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let wf = Workflow::with_id("wf", "unknown").task(
            TaskDefinition::new("b", "B", AgentRole::Implementer).with_dependencies(["ghost"]),
        );
        assert!(matches!(
            wf.validate(),
            Err(MaestroError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_context_completes_without_errors() {
        let mut ctx = WorkflowContext::new("wf");
        ctx.start().unwrap();
        let task = TaskDefinition::new("a", "A", AgentRole::Analyzer).with_cache_key("k");
        ctx.record_success(&task, outcome("a"), false);
        ctx.finish();
        assert_eq!(ctx.status, WorkflowStatus::Completed);
        assert!(ctx.cache.contains_key("k"));
        assert_eq!(ctx.checkpoints.len(), 1);
        assert_eq!(ctx.status_of("a"), Some(&TaskStatus::Completed));
    }

    #[test]
    fn test_context_fails_with_errors() {
        let mut ctx = WorkflowContext::new("wf");
        ctx.start().unwrap();
        ctx.record_failure(
            "a",
            TaskStatus::Failed {
                reason: "boom".into(),
            },
            &MaestroError::Agent("boom".into()),
        );
        ctx.finish();
        assert_eq!(ctx.status, WorkflowStatus::Failed);
        assert!(ctx.errors[0].starts_with("a: "));
    }

    #[test]
    fn test_terminal_context_cannot_restart() {
        let mut ctx = WorkflowContext::new("wf");
        ctx.start().unwrap();
        ctx.finish();
        assert!(matches!(ctx.start(), Err(MaestroError::WorkflowTerminal(_))));
        ctx.errors.push("late".into());
        ctx.finish();
        assert_eq!(ctx.status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_metrics_ratios() {
        let m = WorkflowMetrics::compute(1_000, 3_000, 4, 3, 1, 0);
        assert!((m.parallel_speedup - 3.0).abs() < f64::EPSILON);
        assert!((m.parallel_efficiency - 0.75).abs() < f64::EPSILON);
        assert!((m.tasks_per_second - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metrics_zero_wall_clock() {
        let m = WorkflowMetrics::compute(0, 0, 2, 1, 0, 1);
        assert_eq!(m.tasks_per_second, 0.0);
        assert_eq!(m.parallel_speedup, 1.0);
    }
}
