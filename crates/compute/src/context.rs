//! Owning context: a job queue drained by the thread that created it.
//!
//! Worker threads never call completion callbacks directly. They post a job
//! through a [`LoopHandle`] and the owning thread runs it the next time it
//! drains its [`EventLoop`]. Jobs run strictly in the order they were posted.

use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

/// A unit of work posted to an owning context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The receiving side of an owning context. Bound to the thread that created it.
pub struct EventLoop {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    owner: ThreadId,
    // Drain operations must stay on the owning thread.
    _not_send: PhantomData<*const ()>,
}

/// Cloneable, thread-safe handle used to post jobs into an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    sender: Sender<Job>,
    owner: ThreadId,
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            owner: thread::current().id(),
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            sender: self.sender.clone(),
            owner: self.owner,
        }
    }

    /// Number of jobs waiting to be drained.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Run every job that is already queued. Returns how many ran.
    ///
    /// Jobs posted while draining are picked up in the same call.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one job and run it.
    pub fn run_once(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(job) => {
                job();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Keep draining until `duration` has elapsed.
    pub fn run_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.run_once(deadline - now);
        }
        self.run_pending();
    }

    /// Drain until `done` returns true or `timeout` elapses.
    ///
    /// `done` is evaluated before waiting and after every job.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return done();
            }
            self.run_once(deadline - now);
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHandle {
    /// Queue a job for the owning thread. Never blocks.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            debug!("event loop dropped, discarding posted job");
        }
    }

    /// Whether the calling thread owns this loop.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("owner", &self.owner).finish()
    }
}
