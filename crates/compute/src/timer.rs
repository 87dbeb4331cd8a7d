//! One background thread that runs jobs after a delay.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::context::Job;

/// Identifies a scheduled job so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
    next_token: AtomicU64,
}

/// Delay queue backed by a dedicated thread.
///
/// Jobs run on the timer thread. Anything that must run on an owning context
/// should post itself there from the job.
pub struct DelayTimer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl DelayTimer {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
            next_token: AtomicU64::new(1),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_timer(worker))?;
        let thread_id = thread.thread().id();

        Ok(Self {
            shared,
            thread: Some(thread),
            thread_id,
        })
    }

    /// Run `job` once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerToken {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        {
            let mut state = self.shared.state.lock();
            state.jobs.insert(token, Box::new(job));
            state.deadlines.push(Reverse((deadline, token)));
        }
        self.shared.wake.notify_one();
        TimerToken(token)
    }

    /// Drop a scheduled job. Returns false if it already ran or was cancelled.
    pub fn cancel(&self, token: TimerToken) -> bool {
        self.shared.state.lock().jobs.remove(&token.0).is_some()
    }

    /// Number of jobs still waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }
}

fn run_timer(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let next = state.deadlines.peek().map(|Reverse(entry)| *entry);
        match next {
            None => shared.wake.wait(&mut state),
            Some((deadline, token)) => {
                if Instant::now() < deadline {
                    shared.wake.wait_until(&mut state, deadline);
                    continue;
                }
                state.deadlines.pop();
                // Cancelled tokens have no job left.
                if let Some(job) = state.jobs.remove(&token) {
                    MutexGuard::unlocked(&mut state, job);
                }
            }
        }
    }
    debug!("delay timer stopped");
}

impl Drop for DelayTimer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            // A job that drops the last owner runs on the timer thread itself.
            if thread::current().id() != self.thread_id {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for DelayTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayTimer")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn jobs_fire_in_deadline_order() {
        let timer = DelayTimer::new("test-timer").unwrap();
        let (tx, rx) = mpsc::channel();

        let late = tx.clone();
        timer.schedule(Duration::from_millis(60), move || late.send("late").unwrap());
        timer.schedule(Duration::from_millis(10), move || tx.send("early").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn cancelled_job_never_runs() {
        let timer = DelayTimer::new("test-timer").unwrap();
        let (tx, rx) = mpsc::channel::<()>();

        let token = timer.schedule(Duration::from_millis(30), move || tx.send(()).unwrap());
        assert!(timer.cancel(token));
        assert!(!timer.cancel(token));

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn drop_stops_thread_with_pending_jobs() {
        let timer = DelayTimer::new("test-timer").unwrap();
        timer.schedule(Duration::from_secs(60), || {});
        assert_eq!(timer.pending(), 1);
        drop(timer);
    }
}
