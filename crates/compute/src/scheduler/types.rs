use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceError;

/// Process-wide unique, monotonically increasing task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which worker tier a task runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// I/O and ordinary calculations.
    #[default]
    General,
    /// Resource-hungry compute such as model inference.
    Exclusive,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::General => f.write_str("general"),
            ResourceClass::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Progress value meaning "no percentage is known".
pub const INDETERMINATE_PROGRESS: i32 = -1;

/// Clamp a progress value into `[-1, 100]`.
pub fn clamp_progress(value: i32) -> i32 {
    value.clamp(INDETERMINATE_PROGRESS, 100)
}

/// Error delivered in place of a result when a task body does not produce one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),
    #[error("Task panicked: {0}")]
    Panicked(String),
    #[error("Resource unavailable: {0}")]
    Resource(#[from] ResourceError),
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::Failed(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::Failed(message.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Readable text from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What a finished task delivers to its callback and observers.
pub type TaskOutcome<T> = Result<T, TaskError>;

/// Serializable view of a task for UI consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub resource_class: ResourceClass,
    pub progress: i32,
    pub is_finished: bool,
    pub failed: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Errors raised while building scheduler infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Failed to start background thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_monotonic() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b > a);
        assert_eq!(format!("{}", TaskId(3)), "#3");
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(clamp_progress(-20), INDETERMINATE_PROGRESS);
        assert_eq!(clamp_progress(150), 100);
        assert_eq!(clamp_progress(42), 42);
    }

    #[test]
    fn resource_class_serializes_snake_case() {
        let json = serde_json::to_string(&ResourceClass::Exclusive).unwrap();
        assert_eq!(json, "\"exclusive\"");
        assert_eq!(ResourceClass::default(), ResourceClass::General);
    }

    #[test]
    fn error_conversions() {
        assert_eq!(TaskError::from("boom"), TaskError::Failed("boom".into()));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.png");
        assert_eq!(TaskError::from(io), TaskError::Failed("missing.png".into()));
    }
}
