//! `hive-scheduler` — in-process task scheduler with four temporal execution
//! models and per-task change subscriptions.
//!
//! # Overview
//!
//! Tasks live in a [`registry::TaskRegistry`] keyed by name. The
//! [`scheduler::TaskScheduler`] validates definitions, arms one timer per
//! task, and on each firing resolves the callback's result (plain value,
//! thunk, future, or stream) into the task's `response`, republishing the
//! task so watchers see it.
//!
//! # Task kinds
//!
//! | Kind       | Behaviour                                               |
//! |------------|---------------------------------------------------------|
//! | `Cron`     | Fire on a cron expression, optionally in a named zone   |
//! | `Interval` | Fire every N milliseconds                               |
//! | `Delay`    | Fire once after N milliseconds                          |
//! | `RunAt`    | Fire once at an absolute instant (one-shot, not re-armed) |

pub mod error;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod timing;

pub use error::{Result, SchedulerError};
pub use registry::TaskRegistry;
pub use scheduler::TaskScheduler;
pub use task::{ContextRef, ScheduleTask, TaskKind, TaskOutput};
