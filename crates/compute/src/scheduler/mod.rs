//! Two-tier task scheduler with owning-context completion delivery.
//!
//! The [`Scheduler`] routes each [`Task`] to the general or the exclusive
//! [`WorkerPoolTier`], keeps it alive until its completion has been fully
//! delivered on the owning context, and records [`SchedulerMetrics`].

pub mod metrics;
pub mod pool;
pub mod runner;
pub mod task;
pub mod types;

pub use metrics::SchedulerMetrics;
pub use pool::{TierMetrics, WorkerPoolTier};
pub use runner::Scheduler;
pub use task::{ProgressReporter, Task, TaskView};
pub use types::{
    clamp_progress, ComputeError, ResourceClass, TaskError, TaskId, TaskOutcome, TaskSnapshot,
    INDETERMINATE_PROGRESS,
};
