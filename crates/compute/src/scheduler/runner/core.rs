use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;
use vision_core::SchedulerConfig;

use crate::context::LoopHandle;
use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::pool::WorkerPoolTier;
use crate::scheduler::task::TaskView;
use crate::scheduler::types::{ComputeError, ResourceClass, TaskId};
use crate::timer::DelayTimer;

/// Tasks started by the scheduler whose completion has not been delivered yet.
pub(crate) type RunningSet = Arc<Mutex<HashMap<TaskId, Arc<dyn TaskView>>>>;

/// The task scheduler. Owns a general and an optional exclusive
/// [`WorkerPoolTier`] and delivers completions to one owning context.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) general: WorkerPoolTier,
    /// `None` when configured with zero exclusive threads.
    pub(super) exclusive: Option<WorkerPoolTier>,
    /// Context that receives callbacks for tasks created through `submit`.
    pub(super) context: LoopHandle,
    /// Strong references that keep started tasks alive until delivery.
    pub(super) running: RunningSet,
    pub(super) metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Drives delayed jobs such as resource warm-up.
    pub(super) timer: DelayTimer,
}

impl Scheduler {
    /// Create a scheduler whose tasks report back to `context`.
    pub fn new(config: &SchedulerConfig, context: LoopHandle) -> Result<Self, ComputeError> {
        let general = WorkerPoolTier::new(ResourceClass::General, config.resolved_general_threads())?;
        let exclusive = match config.resolved_exclusive_threads() {
            0 => None,
            n => Some(WorkerPoolTier::new(ResourceClass::Exclusive, n)?),
        };

        info!(
            "Scheduler starting with {} general threads, {} exclusive threads",
            general.capacity(),
            exclusive.as_ref().map_or(0, WorkerPoolTier::capacity)
        );

        Ok(Self {
            config: config.clone(),
            general,
            exclusive,
            context,
            running: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            timer: DelayTimer::new("vision-scheduler-timer")?,
        })
    }

    /// Tier that runs work of `class`. Exclusive work falls back to the
    /// general tier when the exclusive tier is disabled.
    pub fn tier_for(&self, class: ResourceClass) -> &WorkerPoolTier {
        match (class, &self.exclusive) {
            (ResourceClass::Exclusive, Some(tier)) => tier,
            _ => &self.general,
        }
    }

    pub fn general_capacity(&self) -> usize {
        self.general.capacity()
    }

    /// 0 when the exclusive tier is disabled.
    pub fn exclusive_capacity(&self) -> usize {
        self.exclusive.as_ref().map_or(0, WorkerPoolTier::capacity)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Handle to the context that receives completions for `submit`.
    pub fn context(&self) -> &LoopHandle {
        &self.context
    }

    /// Number of started tasks whose completion is not yet delivered.
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.running.lock().contains_key(&id)
    }

    /// Views of every task currently held by the scheduler.
    pub fn running_tasks(&self) -> Vec<Arc<dyn TaskView>> {
        self.running.lock().values().cloned().collect()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let mut snapshot = self.metrics.read().clone();
        snapshot.running_tasks = self.running_count();
        snapshot.general = Some(self.general.metrics());
        snapshot.exclusive = self.exclusive.as_ref().map(WorkerPoolTier::metrics);
        snapshot
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("general", &self.general)
            .field("exclusive", &self.exclusive)
            .field("running", &self.running_count())
            .finish()
    }
}
