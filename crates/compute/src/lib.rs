pub mod compute;
pub mod context;
pub mod events;
pub mod global;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod timer;

pub use context::{EventLoop, LoopHandle};
pub use events::{Signal, SubscriptionId};
pub use registry::{RegistryEvent, TaskRegistry};
pub use resource::{CreationState, ResourceError, ResourceFactory, ResourcePool, SharedResourceHandle};
pub use scheduler::{
    ComputeError, ProgressReporter, ResourceClass, Scheduler, SchedulerMetrics, Task, TaskError,
    TaskId, TaskOutcome, TaskSnapshot, TaskView, WorkerPoolTier,
};
pub use timer::{DelayTimer, TimerToken};
pub use vision_core::{Config, RegistryConfig, ResourceConfig, SchedulerConfig};
