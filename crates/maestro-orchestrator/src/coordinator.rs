use crate::agent::{Agent, TaskContext};
use crate::config::OrchestratorConfig;
use crate::sink::{ContextRecord, LogRecord, LogStatus, Sink};
use chrono::Utc;
use maestro_core::{
    AgentRole, ErrorKind, MaestroError, MaestroResult, TaskDefinition, TaskOutcome, TaskStatus,
    WorkflowContext,
};
use maestro_events::{topics, EventBus};
use maestro_resilience::{
    CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState, RetryContext, RetryExecutor,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct AgentSlot {
    agent: Arc<dyn Agent>,
    role: AgentRole,
    seq: usize,
    load: AtomicUsize,
    executions: AtomicU64,
    failures: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl AgentSlot {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn record(&self, duration_ms: u64, success: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Holds one unit of an agent's load; released on drop, including when the
/// surrounding future is cancelled by a task timeout.
struct LoadGuard(Arc<AgentSlot>);

impl LoadGuard {
    fn acquire(slot: Arc<AgentSlot>) -> Self {
        slot.load.fetch_add(1, Ordering::SeqCst);
        Self(slot)
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.load.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-agent counters for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    pub name: String,
    pub role: AgentRole,
    pub current_load: usize,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub circuit_state: CircuitState,
}

/// Status recorded for a task whose dispatch failed.
pub fn failure_status(err: &MaestroError) -> TaskStatus {
    match err.kind() {
        ErrorKind::TaskTimeout => TaskStatus::TimedOut,
        _ => TaskStatus::Failed {
            reason: err.root_cause().to_string(),
        },
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Registry of agents by role, and the single path through which tasks reach them.
///
/// Every call goes through the agent's circuit breaker inside a retry loop,
/// bounded by the task's timeout. Breakers live as long as the coordinator,
/// so fault memory carries over between workflow runs.
pub struct AgentCoordinator {
    config: OrchestratorConfig,
    events: Arc<EventBus>,
    sink: Arc<dyn Sink>,
    agents: RwLock<BTreeMap<AgentRole, Vec<Arc<AgentSlot>>>>,
    next_seq: AtomicUsize,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
}

impl AgentCoordinator {
    pub fn new(config: OrchestratorConfig, events: Arc<EventBus>, sink: Arc<dyn Sink>) -> Self {
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone())
                .with_event_bus(events.clone()),
        );
        let retry = RetryExecutor::new()
            .with_event_bus(events.clone())
            .with_breakers(breakers.clone());
        Self {
            config,
            events,
            sink,
            agents: RwLock::new(BTreeMap::new()),
            next_seq: AtomicUsize::new(0),
            breakers,
            retry,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Add `agent` as a candidate for `role`. Candidates listed in
    /// `agent_preferences` come first, in that order; the rest keep registration order.
    pub fn register(&self, role: AgentRole, agent: Arc<dyn Agent>) -> MaestroResult<()> {
        let name = agent.name().to_string();
        let mut agents = self.agents.write();
        let slots = agents.entry(role.clone()).or_default();
        if slots.iter().any(|s| s.name() == name) {
            return Err(MaestroError::Config(format!(
                "agent '{name}' is already registered for role '{role}'"
            )));
        }
        slots.push(Arc::new(AgentSlot {
            agent,
            role: role.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            load: AtomicUsize::new(0),
            executions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }));
        slots.sort_by_key(|s| {
            (
                self.config.preference_rank(&role, s.name()).unwrap_or(usize::MAX),
                s.seq,
            )
        });
        drop(agents);

        self.breakers.get_or_create(&name);
        info!(agent = %name, role = %role, "Agent registered");
        Ok(())
    }

    /// Candidate names for `role`, most preferred first.
    pub fn agents_for(&self, role: &AgentRole) -> Vec<String> {
        self.agents
            .read()
            .get(role)
            .map(|slots| slots.iter().map(|s| s.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Whether the agent's breaker currently admits calls.
    pub fn is_healthy(&self, agent: &str) -> bool {
        self.breakers
            .get(agent)
            .map_or(true, |breaker| breaker.is_call_permitted())
    }

    pub fn current_load(&self, agent: &str) -> Option<usize> {
        self.agents
            .read()
            .values()
            .flatten()
            .find(|s| s.name() == agent)
            .map(|s| s.load.load(Ordering::SeqCst))
    }

    fn select_slot(&self, role: &AgentRole, preferred: Option<&str>) -> MaestroResult<Arc<AgentSlot>> {
        let agents = self.agents.read();
        let candidates: &[Arc<AgentSlot>] = agents.get(role).map(Vec::as_slice).unwrap_or_default();

        if let Some(name) = preferred {
            match candidates.iter().find(|s| s.name() == name) {
                Some(slot) if self.is_healthy(name) => return Ok(slot.clone()),
                Some(_) => debug!(agent = name, role = %role, "Preferred agent unhealthy, falling back"),
                None => warn!(agent = name, role = %role, "Preferred agent not registered for role"),
            }
        }

        candidates
            .iter()
            .filter(|s| self.is_healthy(s.name()))
            .min_by_key(|s| s.load.load(Ordering::SeqCst))
            .cloned()
            .ok_or_else(|| MaestroError::NoAgentAvailable {
                role: role.to_string(),
            })
    }

    /// Pick an agent for `role`: the preferred one if healthy, else the
    /// least-loaded healthy candidate (ties go to the more preferred).
    pub fn select_agent(&self, role: &AgentRole, preferred: Option<&str>) -> MaestroResult<Arc<dyn Agent>> {
        self.select_slot(role, preferred).map(|slot| slot.agent.clone())
    }

    /// Run one task against `ctx`: cache fast path, else dispatch, then record
    /// the outcome into the context.
    pub async fn execute_task(
        &self,
        task: &TaskDefinition,
        ctx: &mut WorkflowContext,
    ) -> MaestroResult<TaskOutcome> {
        if let Some(hit) = self.resolve_cached(task, ctx).await {
            return Ok(hit);
        }

        ctx.mark_running(&task.id);
        let view = TaskContext::for_task(task, ctx);
        match self.dispatch(task, view).await {
            Ok(outcome) => {
                ctx.record_success(task, outcome.clone(), false);
                Ok(outcome)
            }
            Err(err) => {
                ctx.record_failure(&task.id, failure_status(&err), &err);
                Err(err)
            }
        }
    }

    /// Select an agent and run `task` on it under retry, breaker and timeout.
    /// Does not consult any cache. Failures come back wrapped in
    /// [`MaestroError::TaskFailed`].
    pub async fn dispatch(&self, task: &TaskDefinition, view: TaskContext) -> MaestroResult<TaskOutcome> {
        let workflow_id = view.workflow_id.clone();
        let slot = match self.select_slot(&task.role, task.preferred_agent.as_deref()) {
            Ok(slot) => slot,
            Err(err) => {
                self.report_failure(task, &workflow_id, None, &err, 0).await;
                return Err(err.for_task(workflow_id, &task.id));
            }
        };
        let agent_name = slot.name().to_string();
        let guard = LoadGuard::acquire(slot.clone());

        info!(
            workflow_id = %workflow_id,
            task_id = %task.id,
            agent = %agent_name,
            role = %task.role,
            "Dispatching task"
        );
        self.events
            .publish_async(
                topics::TASK_STARTED,
                &json!({
                    "workflow_id": workflow_id,
                    "task_id": task.id,
                    "agent": agent_name,
                    "role": task.role,
                }),
            )
            .await;
        self.log(
            LogRecord::new(&workflow_id, &task.id, task.role.to_string(), "execute", LogStatus::Started)
                .with_metadata(json!({ "agent": agent_name })),
        )
        .await;

        let policy = self
            .config
            .retry
            .policy(task.max_retries)
            .with_circuit_breaker(agent_name.as_str());
        let retry_ctx = RetryContext::new(&workflow_id, &task.id, &agent_name);
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let run = self.retry.execute_with_retry(
            |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                slot.agent.execute(task, &view)
            },
            &policy,
            &retry_ctx,
        );
        let result = match tokio::time::timeout(task.timeout(), run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task_id = %task.id, timeout_ms = task.timeout_ms, "Task timed out");
                Err(MaestroError::TaskTimeout {
                    task_id: task.id.clone(),
                    timeout_ms: task.timeout_ms,
                })
            }
        };
        let duration_ms = millis(started.elapsed());
        drop(guard);
        slot.record(duration_ms, result.is_ok());
        let attempts = attempts.load(Ordering::Relaxed);

        match result {
            Ok(output) => {
                let outcome = TaskOutcome {
                    task_id: task.id.clone(),
                    agent: agent_name,
                    output,
                    attempts,
                    duration_ms,
                    completed_at: Utc::now(),
                };
                self.report_success(task, &workflow_id, &outcome).await;
                Ok(outcome)
            }
            Err(err) => {
                self.report_failure(task, &workflow_id, Some(&agent_name), &err, attempts)
                    .await;
                Err(err.for_task(workflow_id, &task.id))
            }
        }
    }

    /// Satisfy `task` from the context's cache, if it has an entry: the hit is
    /// announced and recorded as [`TaskStatus::Cached`]. `None` means the task
    /// must be dispatched.
    pub async fn resolve_cached(
        &self,
        task: &TaskDefinition,
        ctx: &mut WorkflowContext,
    ) -> Option<TaskOutcome> {
        let hit = ctx.cached(task).cloned()?;
        self.report_cache_hit(task, &ctx.workflow_id, &hit).await;
        ctx.record_success(task, hit.clone(), true);
        Some(hit)
    }

    async fn report_cache_hit(&self, task: &TaskDefinition, workflow_id: &str, outcome: &TaskOutcome) {
        debug!(workflow_id, task_id = %task.id, cache_key = ?task.cache_key, "Cache hit");
        self.events
            .publish_async(
                topics::TASK_CACHE_HIT,
                &json!({
                    "workflow_id": workflow_id,
                    "task_id": task.id,
                    "cache_key": task.cache_key,
                    "agent": outcome.agent,
                }),
            )
            .await;
        self.log(
            LogRecord::new(workflow_id, &task.id, task.role.to_string(), "execute", LogStatus::Cached)
                .with_metadata(json!({ "cache_key": task.cache_key })),
        )
        .await;
    }

    async fn report_success(&self, task: &TaskDefinition, workflow_id: &str, outcome: &TaskOutcome) {
        info!(
            workflow_id,
            task_id = %task.id,
            agent = %outcome.agent,
            attempts = outcome.attempts,
            duration_ms = outcome.duration_ms,
            "Task completed"
        );
        let summary = json!({
            "workflow_id": workflow_id,
            "task_id": task.id,
            "agent": outcome.agent,
            "attempts": outcome.attempts,
            "duration_ms": outcome.duration_ms,
        });
        self.events.publish_async(topics::TASK_COMPLETED, &summary).await;
        self.log(
            LogRecord::new(workflow_id, &task.id, task.role.to_string(), "execute", LogStatus::Success)
                .with_metadata(summary),
        )
        .await;

        let record = ContextRecord {
            timestamp: Utc::now(),
            workflow_id: workflow_id.to_string(),
            task_id: task.id.clone(),
            context_type: "task_output".to_string(),
            content: outcome.output.clone(),
            metadata: json!({ "agent": outcome.agent, "role": task.role }),
        };
        if let Err(e) = self.sink.store_context(record).await {
            warn!(task_id = %task.id, error = %e, "Sink rejected context record");
        }
    }

    async fn report_failure(
        &self,
        task: &TaskDefinition,
        workflow_id: &str,
        agent: Option<&str>,
        err: &MaestroError,
        attempts: u32,
    ) {
        warn!(
            workflow_id,
            task_id = %task.id,
            agent = agent.unwrap_or("-"),
            attempts,
            error = %err,
            "Task failed"
        );
        let data = json!({
            "workflow_id": workflow_id,
            "task_id": task.id,
            "agent": agent,
            "attempts": attempts,
            "error": err.to_string(),
            "kind": err.kind(),
        });
        self.events.publish_async(topics::TASK_FAILED, &data).await;
        self.log(
            LogRecord::new(workflow_id, &task.id, task.role.to_string(), "execute", LogStatus::Failure)
                .with_metadata(data)
                .with_error(err.to_string()),
        )
        .await;
    }

    async fn log(&self, record: LogRecord) {
        let task_id = record.task_id.clone();
        if let Err(e) = self.sink.append_log(record).await {
            warn!(task_id = %task_id, error = %e, "Sink rejected log record");
        }
    }

    /// Counters for every registered agent, by role then preference.
    pub fn agent_stats(&self) -> Vec<AgentStats> {
        let agents = self.agents.read();
        agents
            .values()
            .flatten()
            .map(|slot| {
                let executions = slot.executions.load(Ordering::Relaxed);
                let failures = slot.failures.load(Ordering::Relaxed);
                let total = slot.total_duration_ms.load(Ordering::Relaxed);
                AgentStats {
                    name: slot.name().to_string(),
                    role: slot.role.clone(),
                    current_load: slot.load.load(Ordering::SeqCst),
                    executions,
                    successes: executions - failures,
                    failures,
                    total_duration_ms: total,
                    average_duration_ms: if executions == 0 {
                        0.0
                    } else {
                        total as f64 / executions as f64
                    },
                    circuit_state: self
                        .breakers
                        .get(slot.name())
                        .map_or(CircuitState::Closed, |b| b.state()),
                }
            })
            .collect()
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Agents and breakers as JSON, for dashboards.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "agents": self.agent_stats(),
            "breakers": self.breaker_snapshots(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, NullSink};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Echo(&'static str);

    #[async_trait]
    impl Agent for Echo {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, task: &TaskDefinition, _ctx: &TaskContext) -> MaestroResult<Value> {
            Ok(json!({ "agent": self.0, "task": task.id }))
        }
    }

    struct Broken;

    #[async_trait]
    impl Agent for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _task: &TaskDefinition, _ctx: &TaskContext) -> MaestroResult<Value> {
            Err(MaestroError::Validation("expected 'path' input".into()))
        }
    }

    fn coordinator(config: OrchestratorConfig) -> AgentCoordinator {
        AgentCoordinator::new(config, Arc::new(EventBus::new()), Arc::new(NullSink))
    }

    #[test]
    fn test_register_orders_by_preference() {
        let mut config = OrchestratorConfig::default();
        config
            .agent_preferences
            .insert(AgentRole::Analyzer, vec!["second".into(), "first".into()]);
        let coord = coordinator(config);
        coord.register(AgentRole::Analyzer, Arc::new(Echo("first"))).unwrap();
        coord.register(AgentRole::Analyzer, Arc::new(Echo("unlisted"))).unwrap();
        coord.register(AgentRole::Analyzer, Arc::new(Echo("second"))).unwrap();

        assert_eq!(
            coord.agents_for(&AgentRole::Analyzer),
            vec!["second", "first", "unlisted"]
        );
        assert!(coord.register(AgentRole::Analyzer, Arc::new(Echo("first"))).is_err());
    }

    #[test]
    fn test_select_prefers_least_loaded_then_list_order() {
        let coord = coordinator(OrchestratorConfig::default());
        coord.register(AgentRole::Implementer, Arc::new(Echo("a"))).unwrap();
        coord.register(AgentRole::Implementer, Arc::new(Echo("b"))).unwrap();

        let picked = coord.select_agent(&AgentRole::Implementer, None).unwrap();
        assert_eq!(picked.name(), "a");

        let slot = coord.select_slot(&AgentRole::Implementer, None).unwrap();
        let _busy = LoadGuard::acquire(slot);
        assert_eq!(coord.current_load("a"), Some(1));
        let picked = coord.select_agent(&AgentRole::Implementer, None).unwrap();
        assert_eq!(picked.name(), "b");

        let picked = coord.select_agent(&AgentRole::Implementer, Some("a")).unwrap();
        assert_eq!(picked.name(), "a");
    }

    #[test]
    fn test_select_without_candidates() {
        let coord = coordinator(OrchestratorConfig::default());
        assert!(matches!(
            coord.select_agent(&AgentRole::Reviewer, None),
            Err(MaestroError::NoAgentAvailable { role }) if role == "reviewer"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_skips_open_breakers() {
        let mut config = OrchestratorConfig::default();
        config.circuit_breaker.failure_threshold = 1;
        let coord = coordinator(config);
        coord.register(AgentRole::Refiner, Arc::new(Echo("primary"))).unwrap();
        coord.register(AgentRole::Refiner, Arc::new(Echo("backup"))).unwrap();

        let _ = coord
            .breakers()
            .get_or_create("primary")
            .call(|| async { Err::<(), _>(MaestroError::Network("down".into())) })
            .await;
        assert!(!coord.is_healthy("primary"));

        let picked = coord.select_agent(&AgentRole::Refiner, Some("primary")).unwrap();
        assert_eq!(picked.name(), "backup");
    }

    #[tokio::test]
    async fn test_execute_task_records_into_context() {
        let sink = Arc::new(MemorySink::new());
        let coord = AgentCoordinator::new(
            OrchestratorConfig::default(),
            Arc::new(EventBus::new()),
            sink.clone(),
        );
        coord.register(AgentRole::Analyzer, Arc::new(Echo("echo"))).unwrap();
        let task = TaskDefinition::new("a", "A", AgentRole::Analyzer).with_cache_key("a:v1");
        let mut ctx = WorkflowContext::new("wf");

        let outcome = coord.execute_task(&task, &mut ctx).await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.output["task"], "a");
        assert!(ctx.cache.contains_key("a:v1"));
        assert_eq!(ctx.status_of("a"), Some(&TaskStatus::Completed));

        let again = coord.execute_task(&task, &mut ctx).await.unwrap();
        assert_eq!(again, outcome);
        assert_eq!(ctx.status_of("a"), Some(&TaskStatus::Cached));
        assert_eq!(coord.agent_stats()[0].executions, 1);

        let statuses: Vec<LogStatus> = sink.logs_for("a").iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![LogStatus::Started, LogStatus::Success, LogStatus::Cached]
        );
        assert_eq!(sink.contexts().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried() {
        let coord = coordinator(OrchestratorConfig::default());
        coord.register(AgentRole::Implementer, Arc::new(Broken)).unwrap();
        let task = TaskDefinition::new("a", "A", AgentRole::Implementer).with_max_retries(5);
        let mut ctx = WorkflowContext::new("wf");

        let err = coord.execute_task(&task, &mut ctx).await.unwrap_err();
        assert!(matches!(err, MaestroError::TaskFailed { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(coord.agent_stats()[0].failures, 1);
        assert_eq!(coord.current_load("broken"), Some(0));
        assert!(matches!(ctx.status_of("a"), Some(TaskStatus::Failed { .. })));
        assert_eq!(ctx.errors.len(), 1);
        assert!(ctx.errors[0].starts_with("a: "));
    }

    #[test]
    fn test_to_json_lists_agents_and_breakers() {
        let coord = coordinator(OrchestratorConfig::default());
        coord.register(AgentRole::Reviewer, Arc::new(Echo("r"))).unwrap();
        let value = coord.to_json();
        assert_eq!(value["agents"][0]["name"], "r");
        assert_eq!(value["agents"][0]["role"], "reviewer");
        assert_eq!(value["breakers"][0]["state"], "closed");
    }
}
