use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error};

use super::types::{panic_message, ComputeError, ResourceClass};

type TierJob = Box<dyn FnOnce() + Send + 'static>;

/// Live counters for one tier.
#[derive(Debug, Default)]
struct TierStats {
    active: AtomicUsize,
    queued: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicUsize,
}

/// Point-in-time view of a tier's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierMetrics {
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
    pub peak_active: usize,
    pub completed: usize,
}

/// A bounded-concurrency worker pool.
///
/// Exactly `capacity` named threads pull jobs from one FIFO channel, and each
/// thread runs a single job to completion before taking the next. A job that
/// fans out with `rayon::join` or `par_iter` does so on rayon's global pool
/// while its tier thread waits, so it never pulls in a second job.
///
/// Worker threads exit once every clone of the tier has been dropped and the
/// queue is drained.
#[derive(Clone)]
pub struct WorkerPoolTier {
    class: ResourceClass,
    capacity: usize,
    jobs: Sender<TierJob>,
    stats: Arc<TierStats>,
}

impl WorkerPoolTier {
    pub fn new(class: ResourceClass, capacity: usize) -> Result<Self, ComputeError> {
        let capacity = capacity.max(1);
        let (jobs, queue) = crossbeam_channel::unbounded::<TierJob>();
        let stats = Arc::new(TierStats::default());

        for i in 0..capacity {
            let queue = queue.clone();
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("vision-{class}-{i}"))
                .spawn(move || run_worker(class, queue, stats))?;
        }
        debug!(tier = %class, capacity, "Worker tier started");

        Ok(Self {
            class,
            capacity,
            jobs,
            stats,
        })
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue `job`. Returns immediately.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(Box::new(job)).is_err() {
            // Workers only stop once every sender is gone, and `self` is one.
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            error!(tier = %self.class, "Worker tier has no running threads, job dropped");
        }
    }

    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> TierMetrics {
        TierMetrics {
            capacity: self.capacity,
            active: self.stats.active.load(Ordering::SeqCst),
            queued: self.stats.queued.load(Ordering::SeqCst),
            peak_active: self.stats.peak_active.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
        }
    }
}

fn run_worker(class: ResourceClass, queue: Receiver<TierJob>, stats: Arc<TierStats>) {
    for job in queue.iter() {
        stats.queued.fetch_sub(1, Ordering::SeqCst);
        let now_active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_active.fetch_max(now_active, Ordering::SeqCst);

        let _slot = SlotGuard(&stats);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            error!(tier = %class, "Worker job panicked: {}", panic_message(payload.as_ref()));
        }
    }
    debug!(tier = %class, "Worker thread exiting");
}

/// Frees the slot even if the job unwinds.
struct SlotGuard<'a>(&'a TierStats);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for WorkerPoolTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolTier")
            .field("class", &self.class)
            .field("capacity", &self.capacity)
            .field("active", &self.active())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_on_named_threads() {
        let tier = WorkerPoolTier::new(ResourceClass::Exclusive, 1).unwrap();
        let (tx, rx) = mpsc::channel();
        tier.spawn(move || {
            tx.send(std::thread::current().name().map(String::from)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("vision-exclusive-0"));
    }

    #[test]
    fn panicking_job_does_not_take_down_the_tier() {
        let tier = WorkerPoolTier::new(ResourceClass::General, 1).unwrap();
        tier.spawn(|| panic!("stray job"));
        let (tx, rx) = mpsc::channel();
        tier.spawn(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let tier = WorkerPoolTier::new(ResourceClass::General, 0).unwrap();
        assert_eq!(tier.capacity(), 1);
    }

    #[test]
    fn single_slot_admits_fifo() {
        let tier = WorkerPoolTier::new(ResourceClass::General, 1).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            tier.spawn(move || {
                std::thread::sleep(Duration::from_millis(2));
                tx.send(i).unwrap();
            });
        }
        let order: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        assert_eq!(tier.metrics().peak_active, 1);
    }

    #[test]
    fn nested_rayon_work_does_not_admit_extra_jobs() {
        let tier = WorkerPoolTier::new(ResourceClass::Exclusive, 2).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            tier.spawn(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                rayon::join(
                    || std::thread::sleep(Duration::from_millis(5)),
                    || std::thread::sleep(Duration::from_millis(40)),
                );
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "capacity 2 exceeded: {}", peak.load(Ordering::SeqCst));
        assert!(tier.metrics().peak_active <= 2);
    }
}
