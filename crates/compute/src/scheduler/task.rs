//! Tasks and their once-only completion protocol.
//!
//! A worker stores the outcome and posts a delivery job to the task's owning
//! context. Delivery then runs on that context, in this order:
//!
//! 1. the attached callback, if any, which is then dropped;
//! 2. the typed `finished` observers, then the untyped `completed` observers;
//! 3. the release hook installed by the scheduler, which drops its reference.
//!
//! The callback fires exactly once whether it was attached before or after
//! the worker finished.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::context::LoopHandle;
use crate::events::{Signal, SubscriptionId};

use super::types::{
    clamp_progress, ResourceClass, TaskId, TaskOutcome, TaskSnapshot, INDETERMINATE_PROGRESS,
};

type Callback<T> = Box<dyn FnOnce(&TaskOutcome<T>) + Send + 'static>;

/// Progress value plus its change notifications.
struct ProgressState {
    value: AtomicI32,
    context: LoopHandle,
    changed: Signal<i32>,
}

impl ProgressState {
    fn set(self: &Arc<Self>, value: i32) {
        let value = clamp_progress(value);
        if self.value.swap(value, Ordering::AcqRel) == value {
            return;
        }
        let state = Arc::clone(self);
        self.context.post(move || state.changed.emit(&value));
    }
}

/// Handed to a task body so it can report progress from the worker thread.
#[derive(Clone)]
pub struct ProgressReporter {
    state: Arc<ProgressState>,
}

impl ProgressReporter {
    /// Set progress as a percentage. Values are clamped to `[-1, 100]`.
    pub fn set(&self, value: i32) {
        self.state.set(value);
    }

    pub fn set_indeterminate(&self) {
        self.state.set(INDETERMINATE_PROGRESS);
    }

    /// Progress as the share of `finished` steps out of `total`.
    pub fn step(&self, finished: usize, total: usize) {
        if total == 0 {
            return;
        }
        self.set((finished * 100 / total) as i32);
    }

    /// Progress across equal subtasks, including the running one's own progress.
    pub fn subtask(&self, finished_subtasks: usize, total_subtasks: usize, current_progress: i32) {
        if total_subtasks == 0 {
            return;
        }
        let current = current_progress.clamp(0, 100) as usize;
        self.set(((finished_subtasks * 100 + current) / total_subtasks) as i32);
    }

    pub fn get(&self) -> i32 {
        self.state.value.load(Ordering::Acquire)
    }
}

struct Delivery<T> {
    callback: Option<Callback<T>>,
    delivered: bool,
}

struct TaskInner<T> {
    id: TaskId,
    name: String,
    resource_class: ResourceClass,
    created_at: DateTime<Utc>,
    finished_at: OnceLock<DateTime<Utc>>,
    started: AtomicBool,
    progress: Arc<ProgressState>,
    context: LoopHandle,
    result: OnceLock<TaskOutcome<T>>,
    delivery: Mutex<Delivery<T>>,
    finished: Signal<TaskOutcome<T>>,
    completed: Signal<TaskId>,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Handle to a unit of asynchronous work producing `T`.
///
/// Cloning is cheap; all clones refer to the same task. A tuple result is
/// received by destructuring it in the callback: `|outcome| if let Ok((a, b)) = outcome`.
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// Create a task whose callback and notifications are delivered on `context`.
    pub fn new(name: impl Into<String>, resource_class: ResourceClass, context: LoopHandle) -> Self {
        let progress = Arc::new(ProgressState {
            value: AtomicI32::new(INDETERMINATE_PROGRESS),
            context: context.clone(),
            changed: Signal::new(),
        });
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::next(),
                name: name.into(),
                resource_class,
                created_at: Utc::now(),
                finished_at: OnceLock::new(),
                started: AtomicBool::new(false),
                progress,
                context,
                result: OnceLock::new(),
                delivery: Mutex::new(Delivery {
                    callback: None,
                    delivered: false,
                }),
                finished: Signal::new(),
                completed: Signal::new(),
                release: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn resource_class(&self) -> ResourceClass {
        self.inner.resource_class
    }

    pub fn progress(&self) -> i32 {
        self.inner.progress.value.load(Ordering::Acquire)
    }

    pub fn progress_known(&self) -> bool {
        self.progress() >= 0
    }

    pub fn set_progress(&self, value: i32) {
        self.inner.progress.set(value);
    }

    pub fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter {
            state: Arc::clone(&self.inner.progress),
        }
    }

    /// True once the worker has stored an outcome.
    pub fn is_finished(&self) -> bool {
        self.inner.result.get().is_some()
    }

    /// True once delivery has started on the owning context.
    pub fn is_completed(&self) -> bool {
        self.inner.delivery.lock().delivered
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.finished_at.get().copied()
    }

    /// Clone of the outcome, if the task has finished.
    pub fn result(&self) -> Option<TaskOutcome<T>>
    where
        T: Clone,
    {
        self.inner.result.get().cloned()
    }

    /// Borrow the outcome, if the task has finished.
    pub fn with_result<R>(&self, f: impl FnOnce(&TaskOutcome<T>) -> R) -> Option<R> {
        self.inner.result.get().map(f)
    }

    /// Set the completion callback.
    ///
    /// If the outcome has already been delivered, `callback` runs right away
    /// on the calling thread. Otherwise it is stored and later invoked on the
    /// owning context, replacing any callback attached earlier.
    pub fn attach_callback(&self, callback: impl FnOnce(&TaskOutcome<T>) + Send + 'static) {
        let mut delivery = self.inner.delivery.lock();
        if delivery.delivered {
            drop(delivery);
            if let Some(outcome) = self.inner.result.get() {
                callback(outcome);
            }
            return;
        }
        if delivery.callback.replace(Box::new(callback)).is_some() {
            debug!(task = %self.inner.id, "replacing previously attached callback");
        }
    }

    /// Observe the outcome on the owning context, after the callback.
    pub fn on_finished(&self, handler: impl Fn(&TaskOutcome<T>) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.finished.subscribe(handler)
    }

    pub fn on_progress_changed(&self, handler: impl Fn(&i32) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.progress.changed.subscribe(handler)
    }

    /// Drop an observer registered through this task.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.finished.unsubscribe(id)
            || self.inner.progress.changed.unsubscribe(id)
            || self.inner.completed.unsubscribe(id)
    }

    /// Finish successfully with `value`.
    pub fn mark_finished(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Store the outcome and queue delivery on the owning context.
    ///
    /// Only the first call has any effect; later calls return false.
    pub fn finish(&self, outcome: TaskOutcome<T>) -> bool {
        // Stamped before the outcome is published so a snapshot that sees
        // the outcome also sees the time.
        let _ = self.inner.finished_at.set(Utc::now());
        if self.inner.result.set(outcome).is_err() {
            debug!(task = %self.inner.id, "ignoring second completion");
            return false;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.context.post(move || inner.deliver());
        true
    }

    /// Object-safe view used by registries and the scheduler's running set.
    pub fn view(&self) -> Arc<dyn TaskView> {
        self.inner.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.inner.snapshot()
    }

    /// Claim the task for execution. Returns false if it was already started.
    pub(crate) fn mark_started(&self) -> bool {
        !self.inner.started.swap(true, Ordering::AcqRel)
    }

    /// Install the hook that runs after every observer has been notified.
    ///
    /// Runs `release` right away if delivery has already happened.
    pub(crate) fn set_release(&self, release: impl FnOnce() + Send + 'static) {
        let mut slot = self.inner.release.lock();
        if self.inner.delivery.lock().delivered {
            drop(slot);
            release();
            return;
        }
        *slot = Some(Box::new(release));
    }
}

impl<T: Send + Sync + 'static> TaskInner<T> {
    /// Runs on the owning context.
    fn deliver(&self) {
        let Some(outcome) = self.result.get() else {
            return;
        };

        let callback = {
            let mut delivery = self.delivery.lock();
            if delivery.delivered {
                return;
            }
            delivery.delivered = true;
            delivery.callback.take()
        };
        if let Some(callback) = callback {
            callback(outcome);
        }

        self.finished.emit(outcome);
        self.completed.emit(&self.id);

        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        let outcome = self.result.get();
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            resource_class: self.resource_class,
            progress: self.progress.value.load(Ordering::Acquire),
            is_finished: outcome.is_some(),
            failed: outcome.is_some_and(|o| o.is_err()),
            created_at: self.created_at,
            finished_at: self.finished_at.get().copied(),
        }
    }
}

/// Type-erased view over any [`Task`].
pub trait TaskView: Send + Sync {
    fn id(&self) -> TaskId;
    fn name(&self) -> &str;
    fn resource_class(&self) -> ResourceClass;
    fn progress(&self) -> i32;
    fn is_finished(&self) -> bool;
    /// True once completion has been dispatched on the owning context.
    fn is_completed(&self) -> bool;
    fn snapshot(&self) -> TaskSnapshot;
    fn on_progress_changed(&self, handler: Box<dyn Fn(&i32) + Send + Sync>) -> SubscriptionId;
    /// Notified with the task id after the callback and typed observers ran.
    fn on_completed(&self, handler: Box<dyn Fn(&TaskId) + Send + Sync>) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

impl<T: Send + Sync + 'static> TaskView for TaskInner<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_class(&self) -> ResourceClass {
        self.resource_class
    }

    fn progress(&self) -> i32 {
        self.progress.value.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        self.result.get().is_some()
    }

    fn is_completed(&self) -> bool {
        self.delivery.lock().delivered
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskInner::snapshot(self)
    }

    fn on_progress_changed(&self, handler: Box<dyn Fn(&i32) + Send + Sync>) -> SubscriptionId {
        self.progress.changed.subscribe(handler)
    }

    fn on_completed(&self, handler: Box<dyn Fn(&TaskId) + Send + Sync>) -> SubscriptionId {
        self.completed.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.completed.unsubscribe(id)
            || self.progress.changed.unsubscribe(id)
            || self.finished.unsubscribe(id)
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("resource_class", &self.inner.resource_class)
            .field("finished", &self.inner.result.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::context::EventLoop;
    use crate::scheduler::types::TaskError;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Progress(i32),
        Finished(i32),
    }

    #[test]
    fn progress_then_finished_sequence() {
        let event_loop = EventLoop::new();
        let task = Task::<i32>::new("sequence", ResourceClass::General, event_loop.handle());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        task.on_progress_changed(move |v| s.lock().push(Seen::Progress(*v)));
        let s = Arc::clone(&seen);
        task.on_finished(move |outcome| {
            if let Ok(v) = outcome {
                s.lock().push(Seen::Finished(*v));
            }
        });

        task.set_progress(-1);
        task.set_progress(37);
        task.mark_finished(42);
        event_loop.run_pending();

        assert_eq!(*seen.lock(), vec![Seen::Progress(37), Seen::Finished(42)]);
        assert_eq!(task.result(), Some(Ok(42)));
        assert_eq!(task.progress(), 37);
    }

    #[test]
    fn progress_reporter_helpers() {
        let event_loop = EventLoop::new();
        let task = Task::<()>::new("steps", ResourceClass::General, event_loop.handle());
        let reporter = task.progress_reporter();

        reporter.step(1, 4);
        assert_eq!(task.progress(), 25);
        reporter.subtask(1, 2, 50);
        assert_eq!(task.progress(), 75);
        reporter.step(3, 0);
        assert_eq!(task.progress(), 75);
        reporter.set(400);
        assert_eq!(task.progress(), 100);
        reporter.set_indeterminate();
        assert!(!task.progress_known());
    }

    #[test]
    fn callback_attached_before_finish_fires_once_on_owner() {
        let event_loop = EventLoop::new();
        let task = Task::<(i32, String)>::new("tuple", ResourceClass::General, event_loop.handle());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&calls);
        task.attach_callback(move |outcome| {
            if let Ok((n, label)) = outcome {
                c.lock().push((*n, label.clone(), thread::current().id()));
            }
        });

        let worker = task.clone();
        thread::spawn(move || worker.mark_finished((7, "seven".into())))
            .join()
            .unwrap();

        // Nothing runs until the owner drains.
        assert!(calls.lock().is_empty());
        event_loop.run_pending();
        event_loop.run_pending();

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 7);
        assert_eq!(calls[0].1, "seven");
        assert_eq!(calls[0].2, thread::current().id());
    }

    #[test]
    fn callback_attached_after_delivery_fires_immediately() {
        let event_loop = EventLoop::new();
        let task = Task::<i32>::new("late", ResourceClass::General, event_loop.handle());
        task.mark_finished(5);
        event_loop.run_pending();
        assert!(task.is_completed());

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        task.attach_callback(move |outcome| {
            assert_eq!(outcome, &Ok(5));
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        event_loop.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_attached_between_finish_and_delivery() {
        let event_loop = EventLoop::new();
        let task = Task::<i32>::new("between", ResourceClass::General, event_loop.handle());
        task.mark_finished(9);
        assert!(task.is_finished());
        assert!(!task.is_completed());

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        task.attach_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // Stored, not invoked, because delivery has not happened yet.
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        event_loop.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_racing_with_finish_fires_exactly_once() {
        for _ in 0..200 {
            let event_loop = EventLoop::new();
            let task = Task::<u32>::new("race", ResourceClass::General, event_loop.handle());
            let calls = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let worker = task.clone();
            let worker_barrier = Arc::clone(&barrier);
            let finisher = thread::spawn(move || {
                worker_barrier.wait();
                worker.mark_finished(11);
            });

            let attacher_task = task.clone();
            let attacher_calls = Arc::clone(&calls);
            let attacher_barrier = Arc::clone(&barrier);
            let attacher = thread::spawn(move || {
                attacher_barrier.wait();
                attacher_task.attach_callback(move |outcome| {
                    assert_eq!(outcome, &Ok(11));
                    attacher_calls.fetch_add(1, Ordering::SeqCst);
                });
            });

            finisher.join().unwrap();
            attacher.join().unwrap();
            event_loop.run_pending();

            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn second_finish_is_ignored() {
        let event_loop = EventLoop::new();
        let task = Task::<i32>::new("twice", ResourceClass::General, event_loop.handle());
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        task.on_finished(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.mark_finished(1));
        assert!(!task.finish(Err(TaskError::Failed("late".into()))));
        event_loop.run_for(Duration::from_millis(10));

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(task.result(), Some(Ok(1)));
    }

    #[test]
    fn release_runs_after_observers() {
        let event_loop = EventLoop::new();
        let task = Task::<i32>::new("release", ResourceClass::General, event_loop.handle());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        task.attach_callback(move |_| o.lock().push("callback"));
        let o = Arc::clone(&order);
        task.on_finished(move |_| o.lock().push("finished"));
        let o = Arc::clone(&order);
        task.view().on_completed(Box::new(move |_: &TaskId| o.lock().push("completed")));
        let o = Arc::clone(&order);
        task.set_release(move || o.lock().push("release"));

        task.mark_finished(0);
        event_loop.run_pending();

        assert_eq!(*order.lock(), vec!["callback", "finished", "completed", "release"]);
    }

    #[test]
    fn release_set_after_delivery_runs_immediately() {
        let event_loop = EventLoop::new();
        let task = Task::<i32>::new("late-release", ResourceClass::General, event_loop.handle());
        task.mark_finished(3);
        event_loop.run_pending();

        let released = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&released);
        task.set_release(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finished_snapshot_always_has_finish_time() {
        for _ in 0..200 {
            let event_loop = EventLoop::new();
            let task = Task::<u8>::new("stamp", ResourceClass::General, event_loop.handle());
            let worker = task.clone();
            let finisher = thread::spawn(move || {
                worker.mark_finished(1);
            });

            loop {
                let snapshot = task.snapshot();
                if snapshot.is_finished {
                    assert!(snapshot.finished_at.is_some());
                    break;
                }
                std::hint::spin_loop();
            }
            finisher.join().unwrap();
        }
    }

    #[test]
    fn snapshot_reports_failure() {
        let event_loop = EventLoop::new();
        let task = Task::<i32>::new("snap", ResourceClass::Exclusive, event_loop.handle());
        let before = task.snapshot();
        assert!(!before.is_finished);
        assert_eq!(before.progress, INDETERMINATE_PROGRESS);
        assert!(before.finished_at.is_none());

        task.finish(Err(TaskError::Failed("bad input".into())));
        let after = task.view().snapshot();
        assert!(after.is_finished);
        assert!(after.failed);
        assert_eq!(after.resource_class, ResourceClass::Exclusive);
        assert!(after.finished_at.is_some());
    }

    #[test]
    fn mark_started_claims_once() {
        let event_loop = EventLoop::new();
        let task = Task::<()>::new("start", ResourceClass::General, event_loop.handle());
        assert!(task.mark_started());
        assert!(!task.mark_started());
    }
}
