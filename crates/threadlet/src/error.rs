//! Error types for threadlet construction and scheduler dispatch.
//!
//! Task-body failures are not errors in this sense: they reject the task's
//! contract with the thrown [`Value`](crate::Value) and never surface here.

/// Construction-time validation errors (bad controls)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Priority name or level not recognised
    #[error("Invalid priority: {0} (expected high, default, low or 1..=3)")]
    InvalidPriority(String),

    /// A duration field was negative, NaN or infinite
    #[error("Invalid {field}: {value} (expected a finite, non-negative number of milliseconds)")]
    InvalidDuration {
        /// Name of the offending field
        field: &'static str,
        /// Offending value as written
        value: String,
    },

    /// A field had the wrong JSON type
    #[error("Type mismatch for {field}: expected {expected}, got {got}")]
    TypeMismatch {
        /// Name of the offending field
        field: &'static str,
        /// Expected type name
        expected: &'static str,
        /// Actual type name
        got: &'static str,
    },

    /// The controls object contained a key that is not a control
    #[error("Unknown control: {0}")]
    UnknownControl(String),
}

/// Errors returned by scheduler dispatch entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// `tick` was called while another dispatch was in progress
    #[error("Scheduler is already dispatching")]
    Busy,

    /// The scheduler has been shut down
    #[error("Scheduler has been shut down")]
    ShutDown,
}

/// Result type for scheduler dispatch
pub type SchedulerResult<T> = Result<T, SchedulerError>;
