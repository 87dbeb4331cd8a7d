//! Observable, ordered collection of tasks for progress views.
//!
//! Each entry moves through `Active -> PendingRemoval -> Removed`. The
//! removal timer starts once the task's completion has been delivered, and
//! either the timer or an explicit removal ends the entry; whichever comes
//! second is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use vision_core::RegistryConfig;

use crate::context::LoopHandle;
use crate::events::{Signal, SubscriptionId};
use crate::scheduler::{ComputeError, TaskId, TaskSnapshot, TaskView};
use crate::timer::{DelayTimer, TimerToken};

/// Payload of every registry notification.
#[derive(Clone)]
pub struct RegistryEvent {
    pub task: Arc<dyn TaskView>,
    /// Position the task is inserted at, or removed from.
    pub index: usize,
}

impl std::fmt::Debug for RegistryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEvent")
            .field("task", &self.task.id())
            .field("index", &self.index)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRemoval {
    token: TimerToken,
    /// Distinguishes this timer from one scheduled for an earlier entry of the same task.
    seq: u64,
}

struct Entry {
    task: Arc<dyn TaskView>,
    completed_sub: Option<SubscriptionId>,
    pending_removal: Option<PendingRemoval>,
}

struct RegistryInner {
    entries: Mutex<Vec<Entry>>,
    removal_delay: Duration,
    timer: DelayTimer,
    context: LoopHandle,
    next_seq: AtomicU64,
    item_adding: Signal<RegistryEvent>,
    item_added: Signal<RegistryEvent>,
    item_removing: Signal<RegistryEvent>,
    item_removed: Signal<RegistryEvent>,
}

/// Ordered list of tasks that evicts each one a fixed delay after it completes.
///
/// Every structural change is bracketed by a before/after notification pair
/// (`item_adding`/`item_added`, `item_removing`/`item_removed`). Notifications
/// are emitted without any registry lock held. Clones share the same list.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    /// Create a registry whose removal timers fire on `context`.
    pub fn new(config: &RegistryConfig, context: LoopHandle) -> Result<Self, ComputeError> {
        Ok(Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(Vec::new()),
                removal_delay: config.removal_delay(),
                timer: DelayTimer::new("vision-registry-timer")?,
                context,
                next_seq: AtomicU64::new(1),
                item_adding: Signal::new(),
                item_added: Signal::new(),
                item_removing: Signal::new(),
                item_removed: Signal::new(),
            }),
        })
    }

    pub fn removal_delay(&self) -> Duration {
        self.inner.removal_delay
    }

    /// Append `task`. Returns false if it is already present.
    pub fn add(&self, task: Arc<dyn TaskView>) -> bool {
        let index = self.len();
        self.insert(task, index)
    }

    /// Insert `task` at `index`, clamped to the current length.
    ///
    /// A task whose completion was already delivered starts its removal
    /// timer straight away.
    pub fn insert(&self, task: Arc<dyn TaskView>, index: usize) -> bool {
        let id = task.id();
        let index = {
            let entries = self.inner.entries.lock();
            if entries.iter().any(|e| e.task.id() == id) {
                debug!(task = %id, "Task already registered");
                return false;
            }
            index.min(entries.len())
        };

        self.inner.item_adding.emit(&RegistryEvent {
            task: Arc::clone(&task),
            index,
        });
        // Observers of `item_adding` may have reshaped the list.
        let index = {
            let mut entries = self.inner.entries.lock();
            if entries.iter().any(|e| e.task.id() == id) {
                debug!(task = %id, "Task registered while its insertion was announced");
                return false;
            }
            let index = index.min(entries.len());
            entries.insert(
                index,
                Entry {
                    task: Arc::clone(&task),
                    completed_sub: None,
                    pending_removal: None,
                },
            );
            index
        };
        let event = RegistryEvent {
            task: Arc::clone(&task),
            index,
        };

        let weak = Arc::downgrade(&self.inner);
        let sub = task.on_completed(Box::new(move |id: &TaskId| {
            if let Some(inner) = weak.upgrade() {
                inner.start_removal_timer(*id);
            }
        }));
        if let Some(entry) = self.inner.entries.lock().iter_mut().find(|e| e.task.id() == id) {
            entry.completed_sub = Some(sub);
        }

        debug!(task = %id, index, "Task registered");
        self.inner.item_added.emit(&event);

        if task.is_completed() {
            self.inner.start_removal_timer(id);
        }
        true
    }

    /// Remove the task with `id`. Unknown ids are a no-op returning false.
    pub fn remove(&self, id: TaskId) -> bool {
        match self.index_of(id) {
            Some(index) => self.inner.remove_entry(index, id).is_some(),
            None => false,
        }
    }

    pub fn remove_at(&self, index: usize) -> Option<Arc<dyn TaskView>> {
        let id = self.inner.entries.lock().get(index)?.task.id();
        self.inner.remove_entry(index, id)
    }

    /// Remove and return the most recently positioned task.
    pub fn take_last(&self) -> Option<Arc<dyn TaskView>> {
        let index = self.len().checked_sub(1)?;
        self.remove_at(index)
    }

    /// Tasks in registry order.
    pub fn items(&self) -> Vec<Arc<dyn TaskView>> {
        self.inner.entries.lock().iter().map(|e| Arc::clone(&e.task)).collect()
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.inner.entries.lock().iter().map(|e| e.task.snapshot()).collect()
    }

    pub fn get(&self, index: usize) -> Option<Arc<dyn TaskView>> {
        self.inner.entries.lock().get(index).map(|e| Arc::clone(&e.task))
    }

    pub fn index_of(&self, id: TaskId) -> Option<usize> {
        self.inner.entries.lock().iter().position(|e| e.task.id() == id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// True while the task's removal timer is armed.
    pub fn is_pending_removal(&self, id: TaskId) -> bool {
        self.inner
            .entries
            .lock()
            .iter()
            .any(|e| e.task.id() == id && e.pending_removal.is_some())
    }

    pub fn item_adding(&self) -> &Signal<RegistryEvent> {
        &self.inner.item_adding
    }

    pub fn item_added(&self) -> &Signal<RegistryEvent> {
        &self.inner.item_added
    }

    pub fn item_removing(&self) -> &Signal<RegistryEvent> {
        &self.inner.item_removing
    }

    pub fn item_removed(&self) -> &Signal<RegistryEvent> {
        &self.inner.item_removed
    }

    #[cfg(test)]
    fn pending_removal_seq(&self, id: TaskId) -> Option<u64> {
        self.inner
            .entries
            .lock()
            .iter()
            .find(|e| e.task.id() == id)
            .and_then(|e| e.pending_removal.map(|p| p.seq))
    }

    #[cfg(test)]
    fn fire_removal_timer(&self, id: TaskId, seq: u64) {
        self.inner.handle_removal_timeout(id, seq);
    }
}

impl RegistryInner {
    fn start_removal_timer(self: &Arc<Self>, id: TaskId) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.task.id() == id) else {
            return;
        };
        if entry.pending_removal.is_some() {
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let context = self.context.clone();
        let token = self.timer.schedule(self.removal_delay, move || {
            context.post(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_removal_timeout(id, seq);
                }
            });
        });
        entry.pending_removal = Some(PendingRemoval { token, seq });
        debug!(task = %id, delay = ?self.removal_delay, "Removal timer started");
    }

    /// Runs on the owning context when a removal timer expires.
    fn handle_removal_timeout(&self, id: TaskId, seq: u64) {
        let index = self
            .entries
            .lock()
            .iter()
            .position(|e| e.task.id() == id && e.pending_removal.is_some_and(|p| p.seq == seq));
        match index {
            Some(index) => {
                self.remove_entry(index, id);
            }
            None => debug!(task = %id, "Removal timer fired for an entry that is already gone"),
        }
    }

    fn remove_entry(&self, index: usize, id: TaskId) -> Option<Arc<dyn TaskView>> {
        let task = {
            let entries = self.entries.lock();
            let entry = entries.get(index).filter(|e| e.task.id() == id)?;
            Arc::clone(&entry.task)
        };

        let event = RegistryEvent { task, index };
        self.item_removing.emit(&event);

        let entry = {
            let mut entries = self.entries.lock();
            // Observers may have reshaped the list while `item_removing` ran.
            let position = entries.iter().position(|e| e.task.id() == id)?;
            entries.remove(position)
        };
        if let Some(pending) = entry.pending_removal {
            self.timer.cancel(pending.token);
        }
        if let Some(sub) = entry.completed_sub {
            entry.task.unsubscribe(sub);
        }

        debug!(task = %id, index, "Task removed from registry");
        self.item_removed.emit(&event);
        Some(entry.task)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("len", &self.len())
            .field("removal_delay", &self.inner.removal_delay)
            .finish()
    }
}
