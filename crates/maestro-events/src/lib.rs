//! In-process publish/subscribe event bus for task lifecycle observation.
//!
//! Observers (logging, metrics, context-store writers) attach to lifecycle
//! events without coupling to the scheduler. One observer failing never
//! affects delivery to the others.
//!
//! # Main types
//!
//! - [`EventBus`]: Priority-ordered dispatcher with per-handler statistics.
//! - [`Handler`]: A synchronous or suspending subscriber callback.
//! - [`Event`]: The payload delivered to handlers.
//! - [`HandlerStats`]: Execution count, average time and error rate of one handler.

/// The dispatcher.
pub mod bus;
/// Event payloads and handler callbacks.
pub mod event;
/// Well-known event type names.
pub mod topics;

pub use bus::{EventBus, HandlerStats, DEFAULT_HISTORY_CAPACITY};
pub use event::{Event, Handler, HandlerResult, EVENT_TYPE_FIELD};
