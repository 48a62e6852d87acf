use async_trait::async_trait;
use maestro_core::{MaestroResult, TaskDefinition, WorkflowContext};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Read-only view of the workflow handed to an agent.
///
/// Owned, so the scheduler can keep mutating its [`WorkflowContext`] while
/// many agent calls are in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskContext {
    pub workflow_id: String,
    /// Outputs of the task's dependencies, keyed by task id.
    pub dependency_outputs: HashMap<String, Value>,
}

impl TaskContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            dependency_outputs: HashMap::new(),
        }
    }

    /// Snapshot the outputs of `task`'s dependencies from `ctx`.
    pub fn for_task(task: &TaskDefinition, ctx: &WorkflowContext) -> Self {
        let dependency_outputs = task
            .dependencies
            .iter()
            .filter_map(|dep| {
                ctx.results
                    .get(dep)
                    .map(|outcome| (dep.clone(), outcome.output.clone()))
            })
            .collect();
        Self {
            workflow_id: ctx.workflow_id.clone(),
            dependency_outputs,
        }
    }

    pub fn dependency_output(&self, task_id: &str) -> Option<&Value> {
        self.dependency_outputs.get(task_id)
    }
}

/// A pluggable capability provider that performs the work for a task.
///
/// Implementations decode and validate `task.inputs` themselves, reporting a
/// bad shape as [`maestro_core::MaestroError::Validation`] (never retried).
/// Must be safe to call concurrently for different tasks.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique name, also used as the agent's circuit breaker key.
    fn name(&self) -> &str;

    /// Perform the task.
    async fn execute(&self, task: &TaskDefinition, ctx: &TaskContext) -> MaestroResult<Value>;
}
