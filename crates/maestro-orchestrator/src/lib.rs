//! Workflow scheduling and agent coordination for Maestro.
//!
//! A [`WorkflowOrchestrator`] runs the tasks of a [`maestro_core::Workflow`] in
//! dependency order with bounded concurrency. Each task is handed to the
//! [`AgentCoordinator`], which picks an [`Agent`] by role, preference and load,
//! and calls it through a circuit breaker and retry policy. Lifecycle events go
//! to the [`maestro_events::EventBus`]; durable records go to a [`Sink`].
//!
//! # Main types
//!
//! - [`WorkflowOrchestrator`]: The scheduler.
//! - [`AgentCoordinator`]: Agent registry, selection and guarded dispatch.
//! - [`Agent`] / [`Sink`]: The two external collaborator interfaces.
//! - [`OrchestratorConfig`]: TOML-loadable configuration.

/// The agent interface.
pub mod agent;
/// Configuration loading and validation.
pub mod config;
/// Agent registry and dispatch.
pub mod coordinator;
/// The workflow scheduler.
pub mod orchestrator;
/// Durable log and context sinks.
pub mod sink;
/// Dependency graph bookkeeping.
pub mod task_graph;
/// Process-wide tracing setup.
pub mod telemetry;

pub use agent::{Agent, TaskContext};
pub use config::{OrchestratorConfig, RetryConfig, TieBreakPolicy};
pub use coordinator::{failure_status, AgentCoordinator, AgentStats};
pub use orchestrator::WorkflowOrchestrator;
pub use sink::{ContextRecord, JsonlSink, LogRecord, LogStatus, MemorySink, NullSink, Sink, SinkEntry};
pub use task_graph::TaskGraph;
pub use telemetry::{init_tracing, TelemetryFormat};
