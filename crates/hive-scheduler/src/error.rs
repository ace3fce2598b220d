use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Tasks are required")]
    TasksRequired,

    #[error("Names are required")]
    NamesRequired,

    /// A task with this name is already registered.
    #[error("Task name '{name}' already registered")]
    NameRegistered { name: String },

    /// Another registered task already uses this priority.
    #[error("Task '{name}' priority '{priority}' already registered")]
    PriorityRegistered { name: String, priority: i64 },

    #[error("Cron tasks require a valid cron expression: {0}")]
    InvalidCron(String),

    #[error("Unrecognized time zone: {0}")]
    InvalidTimeZone(String),

    /// Interval/Delay tasks need a non-negative millisecond value.
    #[error("Task '{name}' requires a valid ms")]
    InvalidMs { name: String },

    /// RunAt tasks must point at the future.
    #[error("Task '{name}' requires a future runAt instant")]
    PastRunAt { name: String },

    /// No task with the given name exists in the registry.
    #[error("Task '{name}' not found")]
    TaskNotFound { name: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
