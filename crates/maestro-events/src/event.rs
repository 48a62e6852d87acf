use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use maestro_core::MaestroResult;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

/// Key injected into every delivered payload.
pub const EVENT_TYPE_FIELD: &str = "_eventType";

/// What a handler reports back to the bus.
pub type HandlerResult = MaestroResult<()>;

type SyncFn = dyn Fn(&Event) -> HandlerResult + Send + Sync;
type AsyncFn = dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// One published event as seen by handlers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    /// The publisher's payload plus `_eventType`.
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event from a borrowed payload. The caller's value is never touched:
    /// objects are cloned, `null` becomes `{}`, any other value is wrapped as `{"value": ...}`.
    pub fn new(event_type: &str, data: &Value) -> Self {
        let mut map = match data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other.clone());
                wrapped
            }
        };
        map.insert(
            EVENT_TYPE_FIELD.to_string(),
            Value::String(event_type.to_string()),
        );
        Self {
            event_type: event_type.to_string(),
            data: Value::Object(map),
            timestamp: Utc::now(),
        }
    }

    /// Look up a field of the payload.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// String field of the payload.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// A subscriber callback. Cloning shares the same callback, so a clone can be
/// passed to [`crate::EventBus::unsubscribe`].
#[derive(Clone)]
pub enum Handler {
    /// Runs inline during dispatch and never suspends.
    Sync(Arc<SyncFn>),
    /// May suspend; only invoked by `publish_async`.
    Async(Arc<AsyncFn>),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: Arc<AsyncFn> = Arc::new(move |event: Event| -> BoxFuture<'static, HandlerResult> {
            Box::pin(f(event))
        });
        Handler::Async(boxed)
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Handler::Async(_))
    }

    /// Identity comparison: true only for clones of the same handler.
    pub fn same_as(&self, other: &Handler) -> bool {
        match (self, other) {
            (Handler::Sync(a), Handler::Sync(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (Handler::Async(a), Handler::Async(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(_) => write!(f, "Handler::Sync"),
            Handler::Async(_) => write!(f, "Handler::Async"),
        }
    }
}
