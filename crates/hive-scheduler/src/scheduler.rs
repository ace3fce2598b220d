//! Task lifecycle operations: validate, register, arm, stop, restart.

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use hive_core::panics::contained;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Result, SchedulerError};
use crate::registry::TaskRegistry;
use crate::task::{resolve, ContextRef, ScheduleTask, TaskFn, TaskKind, TaskOutput};
use crate::timing;

/// Validates, registers, and drives [`ScheduleTask`]s against a shared
/// [`TaskRegistry`]. Also owns the context instances task callbacks can be
/// bound to, keyed by their concrete type.
pub struct TaskScheduler {
    registry: Arc<TaskRegistry>,
    contexts: DashMap<TypeId, ContextRef>,
}

impl TaskScheduler {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            contexts: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> Vec<ScheduleTask> {
        self.registry.values()
    }

    /// Register a context instance; tasks built with
    /// [`ScheduleTask::bind_context`] for `T` get an `Arc<T>` handed to their
    /// callback. Only concrete `'static` types can be registered, so there is
    /// nothing to bind by name at fire time.
    pub fn set_context<T: Any + Send + Sync>(&self, context: Arc<T>) {
        self.contexts.insert(TypeId::of::<T>(), context);
    }

    pub fn contexts(&self) -> Vec<ContextRef> {
        self.contexts.iter().map(|e| e.value().clone()).collect()
    }

    /// Validate, default-fill, register, and start tasks in input order.
    ///
    /// Not atomic: the first validation failure aborts the batch at that
    /// point and tasks already admitted in this call stay registered. A name
    /// that already exists in the registry is replaced (its old timer is
    /// stopped first); the same name twice within one call is an error.
    pub fn add_tasks(&self, tasks: Vec<ScheduleTask>) -> Result<()> {
        if tasks.is_empty() {
            return Err(SchedulerError::TasksRequired);
        }

        let mut batch_names: HashSet<String> = HashSet::new();

        for task in tasks {
            self.validate(&task, &batch_names)?;
            batch_names.insert(task.name.clone());

            let filled = fill_defaults(task);

            if self.registry.exist(&filled.name) {
                self.stop_tasks(&[&filled.name])?;
            }

            let name = filled.name.clone();
            self.registry.set(&name, filled);
            self.start_tasks(&[&name])?;
        }

        Ok(())
    }

    /// Stop and delete the named tasks. Unknown names are an error.
    pub fn remove_tasks(&self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Err(SchedulerError::NamesRequired);
        }

        for name in names {
            self.stop_tasks(&[name])?;
            self.registry.delete(name);
        }

        Ok(())
    }

    /// Disarm the named tasks' timers and clear their stale responses.
    /// Stopping an already-stopped task is a no-op success.
    pub fn stop_tasks(&self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Err(SchedulerError::NamesRequired);
        }

        for name in names {
            let mut task = self
                .registry
                .get(name)
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    name: name.to_string(),
                })?;

            // Bumps the generation, so an in-flight firing started before
            // this stop discards its result instead of committing it.
            task.disarm();
            task.response = None;
            self.registry.set(name, task);
        }

        Ok(())
    }

    /// Arm a fresh timer for each named task, replacing any existing one.
    pub fn start_tasks(&self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Err(SchedulerError::NamesRequired);
        }

        for name in names {
            let task = self
                .registry
                .get(name)
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    name: name.to_string(),
                })?;

            let context = task
                .context
                .and_then(|tid| self.contexts.get(&tid).map(|e| e.value().clone()));

            let handle = spawn_timer(Arc::clone(&self.registry), &task, context);
            task.arm(handle);
        }

        Ok(())
    }

    pub fn restart_tasks(&self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Err(SchedulerError::NamesRequired);
        }

        for name in names {
            self.stop_tasks(&[name])?;
            self.start_tasks(&[name])?;
        }

        Ok(())
    }

    /// Per-name change channel, seeded with the current value.
    pub fn subscribe_to_task(&self, name: &str) -> watch::Receiver<Option<ScheduleTask>> {
        self.registry.watch(name)
    }

    fn validate(&self, task: &ScheduleTask, batch_names: &HashSet<String>) -> Result<()> {
        if batch_names.contains(&task.name) {
            return Err(SchedulerError::NameRegistered {
                name: task.name.clone(),
            });
        }

        if let Some(priority) = task.priority.filter(|p| *p >= 0) {
            let clash = self
                .registry
                .values()
                .iter()
                // a same-name task is about to be replaced, so its priority
                // does not count as taken
                .any(|t| t.name != task.name && t.priority == Some(priority));

            if clash {
                return Err(SchedulerError::PriorityRegistered {
                    name: task.name.clone(),
                    priority,
                });
            }
        }

        match &task.kind {
            TaskKind::Cron {
                cron_time,
                time_zone,
            } => {
                timing::parse_cron(cron_time)?;
                if let Some(zone) = time_zone {
                    timing::parse_zone(zone)?;
                }
            }
            TaskKind::Interval { ms } | TaskKind::Delay { ms } => {
                if *ms < 0 {
                    return Err(SchedulerError::InvalidMs {
                        name: task.name.clone(),
                    });
                }
            }
            TaskKind::RunAt {
                run_at, time_zone, ..
            } => {
                if let Some(zone) = time_zone {
                    timing::parse_zone(zone)?;
                }
                if *run_at <= Utc::now() {
                    return Err(SchedulerError::PastRunAt {
                        name: task.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Defaults-fill: drop negative priorities, normalize RunAt into its
/// delay-equivalent `ms`, clear any stale response carried in the definition.
fn fill_defaults(mut task: ScheduleTask) -> ScheduleTask {
    if task.priority.is_some_and(|p| p < 0) {
        task.priority = None;
    }

    if let TaskKind::RunAt { run_at, ms, .. } = &mut task.kind {
        *ms = timing::run_at_delay_ms(*run_at, Utc::now());
    }

    task.response = None;
    task
}

/// Arm the timer task for one ScheduleTask. Each firing is spawned
/// independently, so a tick can overlap a still-resolving previous firing —
/// tasks wanting mutual exclusion must serialize in their own callback.
fn spawn_timer(
    registry: Arc<TaskRegistry>,
    task: &ScheduleTask,
    context: Option<ContextRef>,
) -> JoinHandle<()> {
    let name = task.name.clone();
    let label = task.kind.label();
    let task_fn = task.task_fn.clone();
    let generation = task.generation.clone();
    let armed_generation = task.current_generation();

    let fire = move || {
        spawn_firing(
            Arc::clone(&registry),
            name.clone(),
            label,
            task_fn.clone(),
            context.clone(),
            generation.clone(),
            armed_generation,
        );
    };

    match task.kind.clone() {
        TaskKind::Interval { ms } => {
            // tokio intervals complete their first tick immediately; shift
            // the start so the first firing lands one period out, and keep
            // the period non-zero.
            let period = Duration::from_millis(ms.max(1) as u64);
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    fire();
                }
            })
        }

        TaskKind::Delay { ms } | TaskKind::RunAt { ms, .. } => {
            let delay = Duration::from_millis(ms.max(0) as u64);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                fire();
            })
        }

        TaskKind::Cron {
            cron_time,
            time_zone,
        } => tokio::spawn(async move {
            loop {
                let next = match timing::next_cron_occurrence(
                    &cron_time,
                    time_zone.as_deref(),
                    Utc::now(),
                ) {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    // expression and zone were validated at admission
                    Err(e) => {
                        error!(task = %cron_time, error = %e, "cron schedule became unusable");
                        break;
                    }
                };

                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                fire();
            }
        }),
    }
}

/// Fire once: run the callback detached so the timer loop never waits on it,
/// and never let a firing failure reach the timer.
#[allow(clippy::too_many_arguments)]
fn spawn_firing(
    registry: Arc<TaskRegistry>,
    name: String,
    label: &'static str,
    task_fn: Option<TaskFn>,
    context: Option<ContextRef>,
    generation: Arc<std::sync::atomic::AtomicU64>,
    armed_generation: u64,
) {
    tokio::spawn(async move {
        // `contained` keeps a process-fatal panic hook from escalating
        // callback panics that are caught right here
        let outcome = std::panic::AssertUnwindSafe(contained(run_firing(
            &registry,
            &name,
            task_fn,
            context,
            &generation,
            armed_generation,
        )))
        .catch_unwind()
        .await;

        if outcome.is_err() {
            error!(task = %name, kind = label, "task firing panicked");
        }
    });
}

async fn run_firing(
    registry: &TaskRegistry,
    name: &str,
    task_fn: Option<TaskFn>,
    context: Option<ContextRef>,
    generation: &std::sync::atomic::AtomicU64,
    armed_generation: u64,
) {
    // Absent callback resolves to nothing, mirroring a null result.
    let output = match task_fn {
        Some(f) => f(context),
        None => TaskOutput::Empty,
    };

    if let Some(value) = resolve(output).await {
        if generation.load(Ordering::SeqCst) != armed_generation {
            debug!(task = %name, "discarding response from a stopped firing");
            return;
        }

        if let Some(mut current) = registry.get(name) {
            current.response = Some(value);
            registry.set(name, current);
        }
    }
}
