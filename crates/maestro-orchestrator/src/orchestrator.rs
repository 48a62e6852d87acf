use crate::agent::TaskContext;
use crate::config::{OrchestratorConfig, TieBreakPolicy};
use crate::coordinator::{failure_status, AgentCoordinator};
use crate::task_graph::TaskGraph;
use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use maestro_core::{
    MaestroError, MaestroResult, TaskDefinition, TaskOutcome, TaskStatus, Workflow,
    WorkflowContext, WorkflowMetrics, WorkflowStatus,
};
use maestro_events::{topics, EventBus};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Runs workflows: dependency order, bounded concurrency, per-task failure containment.
///
/// All in-flight tasks are driven from the task that calls [`WorkflowOrchestrator::run`];
/// the context is only touched between completions, one outcome at a time.
pub struct WorkflowOrchestrator {
    coordinator: Arc<AgentCoordinator>,
    events: Arc<EventBus>,
    config: OrchestratorConfig,
    /// Cached outcomes per workflow id, carried across runs.
    caches: Mutex<HashMap<String, HashMap<String, TaskOutcome>>>,
}

impl WorkflowOrchestrator {
    pub fn new(
        coordinator: Arc<AgentCoordinator>,
        events: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            coordinator,
            events,
            config,
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<AgentCoordinator> {
        &self.coordinator
    }

    /// Cached outcomes remembered for `workflow_id`.
    pub fn cache_for(&self, workflow_id: &str) -> HashMap<String, TaskOutcome> {
        self.caches
            .lock()
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Run `workflow` in a fresh context seeded with its remembered cache.
    ///
    /// Structural problems (duplicate ids, unknown dependencies, cycles, an
    /// unschedulable graph) are returned as `Err`. Task failures are not: they
    /// land in the returned context, whose status is then `Failed`.
    pub async fn run(&self, workflow: &Workflow) -> MaestroResult<WorkflowContext> {
        let ctx = WorkflowContext::new(&workflow.id).with_cache(self.cache_for(&workflow.id));
        self.run_in(workflow, ctx).await
    }

    /// Run `workflow` in a caller-supplied context. A terminal context is rejected.
    pub async fn run_in(
        &self,
        workflow: &Workflow,
        mut ctx: WorkflowContext,
    ) -> MaestroResult<WorkflowContext> {
        let mut graph = match TaskGraph::new(workflow) {
            Ok(graph) => graph,
            Err(e) => {
                error!(workflow_id = %workflow.id, error = %e, "Workflow rejected");
                return Err(e);
            }
        };
        ctx.start()?;

        let max_parallel = self.config.max_parallel_tasks.max(1);
        info!(
            workflow_id = %workflow.id,
            workflow = %workflow.name,
            tasks = graph.len(),
            max_parallel,
            tie_break = ?self.config.tie_break,
            "Workflow started"
        );
        self.events
            .publish_async(
                topics::WORKFLOW_STARTED,
                &json!({
                    "workflow_id": workflow.id,
                    "name": workflow.name,
                    "tasks": graph.len(),
                }),
            )
            .await;

        let started = Instant::now();
        let mut queue: VecDeque<&TaskDefinition> = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();
        // Completions that arrived while the loop was publishing events.
        let mut parked: VecDeque<(&TaskDefinition, MaestroResult<TaskOutcome>)> = VecDeque::new();
        let mut cache_hits = 0;

        loop {
            for (task, dependency) in graph.take_blocked() {
                let err = MaestroError::DependencyFailed {
                    task_id: task.id.clone(),
                    dependency: dependency.clone(),
                };
                warn!(task_id = %task.id, dependency = %dependency, "Skipping task: dependency failed");
                ctx.record_failure(&task.id, TaskStatus::DependencyFailed { dependency }, &err);
                let data = json!({
                    "workflow_id": ctx.workflow_id,
                    "task_id": task.id,
                    "error": err.to_string(),
                    "kind": err.kind(),
                });
                keep_driving(
                    self.events.publish_async(topics::TASK_FAILED, &data),
                    &mut in_flight,
                    &mut parked,
                )
                .await;
                keep_driving(self.checkpoint(&ctx), &mut in_flight, &mut parked).await;
            }
            queue.extend(graph.take_ready());

            let mut resolved_inline = false;
            while in_flight.len() < max_parallel {
                let Some(task) = next_queued(&mut queue, &graph, self.config.tie_break) else {
                    break;
                };
                let hit = keep_driving(
                    self.coordinator.resolve_cached(task, &mut ctx),
                    &mut in_flight,
                    &mut parked,
                )
                .await;
                if hit.is_some() {
                    graph.mark_succeeded(&task.id);
                    cache_hits += 1;
                    resolved_inline = true;
                    keep_driving(self.checkpoint(&ctx), &mut in_flight, &mut parked).await;
                    continue;
                }

                graph.mark_running(&task.id);
                ctx.mark_running(&task.id);
                let view = TaskContext::for_task(task, &ctx);
                let coordinator = &self.coordinator;
                in_flight.push(async move { (task, coordinator.dispatch(task, view).await) });
            }
            if resolved_inline {
                // Cache hits may have unblocked dependents.
                continue;
            }

            let next = match parked.pop_front() {
                Some(done) => Some(done),
                None => in_flight.next().await,
            };
            let Some((task, result)) = next else {
                if graph.is_done() {
                    break;
                }
                let err = MaestroError::Unschedulable {
                    pending: graph.pending_ids(),
                };
                error!(workflow_id = %workflow.id, error = %err, "Workflow cannot make progress");
                return Err(err);
            };

            match result {
                Ok(outcome) => {
                    ctx.record_success(task, outcome, false);
                    graph.mark_succeeded(&task.id);
                }
                Err(err) => {
                    ctx.record_failure(&task.id, failure_status(&err), &err);
                    graph.mark_failed(&task.id);
                }
            }
            keep_driving(self.checkpoint(&ctx), &mut in_flight, &mut parked).await;
        }

        ctx.finish();
        ctx.metrics = Some(metrics(&ctx, started, max_parallel, cache_hits));
        self.caches
            .lock()
            .insert(workflow.id.clone(), ctx.cache.clone());
        self.announce_finish(&ctx).await;
        Ok(ctx)
    }

    async fn checkpoint(&self, ctx: &WorkflowContext) {
        let Some(checkpoint) = ctx.checkpoints.last() else {
            return;
        };
        self.events
            .publish_async(
                topics::TASK_CHECKPOINT,
                &json!({
                    "workflow_id": ctx.workflow_id,
                    "task_id": checkpoint.task_id,
                    "status": checkpoint.status,
                    "timestamp": checkpoint.timestamp,
                }),
            )
            .await;
    }

    async fn announce_finish(&self, ctx: &WorkflowContext) {
        let summary = ctx.summary();
        let topic = if ctx.status == WorkflowStatus::Completed {
            info!(workflow_id = %ctx.workflow_id, "{summary}");
            topics::WORKFLOW_COMPLETED
        } else {
            warn!(workflow_id = %ctx.workflow_id, errors = ctx.errors.len(), "{summary}");
            topics::WORKFLOW_FAILED
        };
        self.events
            .publish_async(
                topic,
                &json!({
                    "workflow_id": ctx.workflow_id,
                    "status": ctx.status,
                    "errors": ctx.errors,
                    "metrics": ctx.metrics,
                }),
            )
            .await;
    }
}

/// Await `fut` while still polling the in-flight dispatches, so a slow event
/// subscriber never stalls agent calls or eats into their timeouts. Dispatches
/// that finish meanwhile are parked in `parked`, in completion order.
async fn keep_driving<F, S>(
    fut: F,
    in_flight: &mut S,
    parked: &mut VecDeque<S::Item>,
) -> F::Output
where
    F: Future,
    S: Stream + Unpin,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return out,
            Some(done) = in_flight.next() => parked.push_back(done),
        }
    }
}

/// Take the next queued task according to `policy`.
fn next_queued<'a>(
    queue: &mut VecDeque<&'a TaskDefinition>,
    graph: &TaskGraph<'_>,
    policy: TieBreakPolicy,
) -> Option<&'a TaskDefinition> {
    match policy {
        TieBreakPolicy::StaticOrder => queue.pop_front(),
        TieBreakPolicy::PriorityPreemptive => {
            let (pos, _) = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| graph.rank(&t.id))?;
            queue.remove(pos)
        }
    }
}

fn metrics(
    ctx: &WorkflowContext,
    started: Instant,
    max_parallel: usize,
    cache_hits: usize,
) -> WorkflowMetrics {
    let wall_clock_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let executed: Vec<&TaskOutcome> = ctx
        .results
        .values()
        .filter(|o| ctx.status_of(&o.task_id) == Some(&TaskStatus::Completed))
        .collect();
    let sequential_estimate_ms = executed.iter().map(|o| o.duration_ms).sum();
    let failed = ctx
        .task_status
        .values()
        .filter(|s| s.is_terminal() && !s.is_success())
        .count();
    WorkflowMetrics::compute(
        wall_clock_ms,
        sequential_estimate_ms,
        max_parallel,
        executed.len(),
        failed,
        cache_hits,
    )
}
