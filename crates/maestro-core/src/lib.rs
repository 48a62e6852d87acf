//! Core types and error definitions for the Maestro orchestration core.
//!
//! This crate provides the foundational types shared across all Maestro crates:
//! the error taxonomy, task definitions, and the per-run workflow context.
//!
//! # Main types
//!
//! - [`MaestroError`]: Unified error enum for every orchestration subsystem.
//! - [`MaestroResult`]: Convenience alias for `Result<T, MaestroError>`.
//! - [`ErrorKind`]: Coarse error classification used by retry allow-lists.
//! - [`TaskDefinition`]: Immutable description of one unit of work.
//! - [`Workflow`]: A named set of interdependent tasks.
//! - [`WorkflowContext`]: Mutable results/errors/checkpoints of one workflow run.

/// Error taxonomy.
pub mod error;
/// Task definitions, roles, priorities and outcomes.
pub mod task;
/// Workflows and the per-run context.
pub mod workflow;

pub use error::{ErrorKind, MaestroError, MaestroResult};
pub use task::{AgentRole, Priority, TaskDefinition, TaskOutcome, TaskStatus};
pub use workflow::{Checkpoint, Workflow, WorkflowContext, WorkflowMetrics, WorkflowStatus};
