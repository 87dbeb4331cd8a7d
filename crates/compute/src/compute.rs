//! Compute requests: tasks that run against a shared resource.
//!
//! The worker body first obtains the resource through its handle, then runs
//! the compute function against it. Neither [`Task`] nor
//! [`SharedResourceHandle`] knows about the other; this module is where they
//! meet.

use std::time::Duration;

use tracing::{debug, warn};

use crate::resource::{ResourceFactory, SharedResourceHandle};
use crate::scheduler::{ProgressReporter, ResourceClass, Scheduler, Task, TaskError};
use crate::timer::TimerToken;

impl Scheduler {
    /// Submit `compute` to the exclusive tier, running it against the
    /// resource behind `handle` once that resource is ready.
    ///
    /// A resource that cannot be built completes the task with
    /// [`TaskError::Resource`].
    pub fn submit_compute<F, T, E, C>(&self, name: impl Into<String>, handle: &SharedResourceHandle<F>, compute: C) -> Task<T>
    where
        F: ResourceFactory,
        T: Send + Sync + 'static,
        E: Into<TaskError>,
        C: FnOnce(&F::Resource, &ProgressReporter) -> Result<T, E> + Send + 'static,
    {
        let handle = handle.clone();
        self.submit(name, ResourceClass::Exclusive, move |progress| -> Result<T, TaskError> {
            let resource = handle.get_or_create()?;
            compute(&resource, progress).map_err(Into::into)
        })
    }

    /// Build the resource behind `handle` on the general tier after `delay`,
    /// so the first real request does not pay for construction.
    pub fn schedule_warm_up<F: ResourceFactory>(&self, handle: &SharedResourceHandle<F>, delay: Duration) -> TimerToken {
        let handle = handle.clone();
        debug!(artifact = %handle.artifact().display(), ?delay, "Scheduling resource warm-up");
        self.schedule_after(delay, ResourceClass::General, move || {
            if let Err(e) = handle.get_or_create() {
                warn!(artifact = %handle.artifact().display(), "Resource warm-up failed: {}", e);
            }
        })
    }

    /// Warm up `handle` after the configured delay if it is marked for preloading.
    pub fn warm_up_if_preloaded<F: ResourceFactory>(&self, handle: &SharedResourceHandle<F>) -> Option<TimerToken> {
        handle
            .preload()
            .then(|| self.schedule_warm_up(handle, self.config().warm_up_delay()))
    }
}
