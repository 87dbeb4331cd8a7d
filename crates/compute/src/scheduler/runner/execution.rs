use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::scheduler::task::{ProgressReporter, Task};
use crate::scheduler::types::{panic_message, ResourceClass, TaskError, TaskOutcome};
use crate::timer::TimerToken;

use super::Scheduler;

impl Scheduler {
    /// Create a task owned by this scheduler's context and start `body` on
    /// the tier matching `class`.
    pub fn submit<T, E, F>(&self, name: impl Into<String>, class: ResourceClass, body: F) -> Task<T>
    where
        T: Send + Sync + 'static,
        E: Into<TaskError>,
        F: FnOnce(&ProgressReporter) -> Result<T, E> + Send + 'static,
    {
        let task = Task::new(name, class, self.context.clone());
        self.run_task(&task, body);
        task
    }

    /// Start `body` for an existing task.
    ///
    /// The scheduler keeps the task alive until its completion has been
    /// delivered. A body error becomes [`TaskError::Failed`] and a panic
    /// becomes [`TaskError::Panicked`]; either way the task still completes.
    /// Starting the same task twice, or a task that already has an outcome,
    /// is ignored.
    pub fn run_task<T, E, F>(&self, task: &Task<T>, body: F)
    where
        T: Send + Sync + 'static,
        E: Into<TaskError>,
        F: FnOnce(&ProgressReporter) -> Result<T, E> + Send + 'static,
    {
        if task.is_finished() {
            warn!(task = %task.id(), "Task {} already finished, ignoring", task.name());
            return;
        }
        if !task.mark_started() {
            warn!(task = %task.id(), "Task {} already started, ignoring", task.name());
            return;
        }

        let id = task.id();
        self.running.lock().insert(id, task.view());
        let running = Arc::clone(&self.running);
        task.set_release(move || {
            running.lock().remove(&id);
        });

        let tier = self.tier_for(task.resource_class());
        debug!(task = %id, tier = %tier.class(), "Queueing task {}", task.name());

        let worker = task.clone();
        let metrics = Arc::clone(&self.metrics);
        tier.spawn(move || {
            let reporter = worker.progress_reporter();
            let started = Instant::now();
            let outcome: TaskOutcome<T> = match catch_unwind(AssertUnwindSafe(|| body(&reporter))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(err.into()),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            let elapsed = started.elapsed();

            {
                let mut m = metrics.write();
                m.record_execution(worker.name(), elapsed);
                if outcome.is_err() {
                    m.record_failure(worker.name());
                }
            }
            match &outcome {
                Ok(_) => debug!(task = %worker.id(), "Task {} completed in {:?}", worker.name(), elapsed),
                Err(e) => warn!(task = %worker.id(), "Task {} failed: {}", worker.name(), e),
            }

            worker.finish(outcome);
        });
    }

    /// Run `f` on the general tier and deliver its return value.
    pub fn call_async<T, F>(&self, name: impl Into<String>, f: F) -> Task<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(name, ResourceClass::General, move |_| Ok::<_, TaskError>(f()))
    }

    /// Run `f` on the exclusive tier and deliver its return value.
    pub fn call_async_exclusive<T, F>(&self, name: impl Into<String>, f: F) -> Task<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(name, ResourceClass::Exclusive, move |_| Ok::<_, TaskError>(f()))
    }

    /// Run `job` on the `class` tier once `delay` has elapsed.
    pub fn schedule_after(
        &self,
        delay: Duration,
        class: ResourceClass,
        job: impl FnOnce() + Send + 'static,
    ) -> TimerToken {
        let tier = self.tier_for(class).clone();
        self.timer.schedule(delay, move || tier.spawn(job))
    }

    /// Cancel a job queued with [`Scheduler::schedule_after`] that has not fired yet.
    pub fn cancel_scheduled(&self, token: TimerToken) -> bool {
        self.timer.cancel(token)
    }
}
