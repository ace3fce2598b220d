use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

/// Opaque reference to a registered context object. Tasks are bound to a
/// context by type, never by inspecting a runtime name.
pub type ContextRef = Arc<dyn Any + Send + Sync>;

/// A task callback: zero-argument apart from its optionally-bound context.
pub type TaskFn = Arc<dyn Fn(Option<ContextRef>) -> TaskOutput + Send + Sync>;

/// When and how a task fires. The per-variant payload is everything the
/// timer needs; there is no untyped options bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Fire on a cron expression, optionally evaluated in a named IANA zone.
    Cron {
        cron_time: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_zone: Option<String>,
    },

    /// Fire every `ms` milliseconds.
    Interval { ms: i64 },

    /// Fire once, `ms` milliseconds after start.
    Delay { ms: i64 },

    /// Fire once at an absolute instant. Normalized into a delay (`ms`) at
    /// registration; not re-armed after firing.
    RunAt {
        run_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_zone: Option<String>,
        #[serde(default)]
        ms: i64,
    },
}

impl TaskKind {
    /// Label used in logs, mirroring the variant name.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Cron { .. } => "Cron",
            TaskKind::Interval { .. } => "Interval",
            TaskKind::Delay { .. } => "Delay",
            TaskKind::RunAt { .. } => "RunAt",
        }
    }
}

/// Everything a task callback is allowed to hand back. `resolve` flattens
/// any of these, recursively, into a final JSON value.
pub enum TaskOutput {
    /// Nothing to record.
    Empty,
    /// A plain value, stored as-is (JSON null counts as nothing).
    Value(Value),
    /// Another callable to invoke and resolve.
    Thunk(Box<dyn FnOnce() -> TaskOutput + Send>),
    /// A deferred value to await and resolve.
    Deferred(BoxFuture<'static, TaskOutput>),
    /// A push sequence; only the first emitted item is taken. An exhausted
    /// or erroring stream resolves to nothing.
    Stream(BoxStream<'static, TaskOutput>),
}

impl fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutput::Empty => write!(f, "Empty"),
            TaskOutput::Value(v) => write!(f, "Value({v})"),
            TaskOutput::Thunk(_) => write!(f, "Thunk(..)"),
            TaskOutput::Deferred(_) => write!(f, "Deferred(..)"),
            TaskOutput::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Recursively resolve a callback result to its final value, one match arm
/// per capability.
pub fn resolve(output: TaskOutput) -> BoxFuture<'static, Option<Value>> {
    Box::pin(async move {
        match output {
            TaskOutput::Empty => None,
            TaskOutput::Value(value) => {
                if value.is_null() {
                    None
                } else {
                    Some(value)
                }
            }
            TaskOutput::Thunk(thunk) => resolve(thunk()).await,
            TaskOutput::Deferred(fut) => resolve(fut.await).await,
            TaskOutput::Stream(mut stream) => match stream.next().await {
                Some(first) => resolve(first).await,
                None => None,
            },
        }
    })
}

/// A scheduled task definition plus its runtime state.
///
/// Clones share the same timer handle and generation counter, so a clone
/// pulled out of the registry always observes the live state.
#[derive(Clone)]
pub struct ScheduleTask {
    /// Unique key within the registry.
    pub name: String,
    pub kind: TaskKind,
    /// Unique across tasks when set; negative values are dropped at
    /// defaults-fill.
    pub priority: Option<i64>,
    /// Type key of the context the callback is bound to, if any. The
    /// scheduler owns the actual instances.
    pub context: Option<TypeId>,
    pub task_fn: Option<TaskFn>,
    /// Last resolved callback result; cleared on stop.
    pub response: Option<Value>,
    /// Bumped on every stop. A firing only commits its response if the
    /// generation it started under is still current.
    pub(crate) generation: Arc<AtomicU64>,
    /// The live timer handle. At most one per task.
    pub(crate) handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ScheduleTask {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: None,
            context: None,
            task_fn: None,
            response: None,
            generation: Arc::new(AtomicU64::new(0)),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<ContextRef>) -> TaskOutput + Send + Sync + 'static,
    {
        self.task_fn = Some(Arc::new(f));
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Bind the callback to the scheduler-registered context of type `T`.
    pub fn bind_context<T: Any + Send + Sync>(mut self) -> Self {
        self.context = Some(TypeId::of::<T>());
        self
    }

    /// Whether a timer is currently armed.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Abort any armed timer and invalidate in-flight firings.
    pub(crate) fn disarm(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    /// Replace the armed timer handle, aborting any previous one.
    pub(crate) fn arm(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }
}

impl fmt::Debug for ScheduleTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleTask")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("has_fn", &self.task_fn.is_some())
            .field("response", &self.response)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_plain_value() {
        assert_eq!(resolve(TaskOutput::Value(json!(7))).await, Some(json!(7)));
        assert_eq!(resolve(TaskOutput::Value(Value::Null)).await, None);
        assert_eq!(resolve(TaskOutput::Empty).await, None);
    }

    #[tokio::test]
    async fn resolve_thunk_chain() {
        let out = TaskOutput::Thunk(Box::new(|| {
            TaskOutput::Thunk(Box::new(|| TaskOutput::Value(json!("inner"))))
        }));
        assert_eq!(resolve(out).await, Some(json!("inner")));
    }

    #[tokio::test]
    async fn resolve_deferred() {
        let out = TaskOutput::Deferred(Box::pin(async { TaskOutput::Value(json!(1.5)) }));
        assert_eq!(resolve(out).await, Some(json!(1.5)));
    }

    #[tokio::test]
    async fn resolve_stream_takes_first() {
        let items = vec![TaskOutput::Value(json!("a")), TaskOutput::Value(json!("b"))];
        let out = TaskOutput::Stream(Box::pin(stream::iter(items)));
        assert_eq!(resolve(out).await, Some(json!("a")));
    }

    #[tokio::test]
    async fn resolve_empty_stream_is_none() {
        let out = TaskOutput::Stream(Box::pin(stream::iter(Vec::<TaskOutput>::new())));
        assert_eq!(resolve(out).await, None);
    }

    #[tokio::test]
    async fn resolve_mixed_nesting() {
        // future -> stream -> thunk -> value
        let out = TaskOutput::Deferred(Box::pin(async {
            TaskOutput::Stream(Box::pin(stream::iter(vec![TaskOutput::Thunk(Box::new(
                || TaskOutput::Value(json!(42)),
            ))])))
        }));
        assert_eq!(resolve(out).await, Some(json!(42)));
    }
}
