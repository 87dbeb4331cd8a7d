//! Lazily constructed, shared compute resources (e.g. loaded inference models).
//!
//! A [`SharedResourceHandle`] builds its resource at most once, on the first
//! worker that asks for it, walking an ordered list of candidate
//! configurations until one succeeds. Concurrent callers block on a condition
//! variable until construction settles. Only worker threads should call
//! [`SharedResourceHandle::get_or_create`]; the owning context uses
//! [`SharedResourceHandle::try_get`].

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use vision_core::ResourceConfig;

use crate::scheduler::types::panic_message;

/// Builds a resource from an artifact and one candidate configuration.
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;
    type Config: Clone + fmt::Debug + Send + Sync + 'static;
    type Error: fmt::Display;

    fn create(&self, artifact: &Path, config: &Self::Config) -> Result<Self::Resource, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
pub enum ResourceError {
    #[error("Candidate {config} failed: {reason}")]
    Candidate { config: String, reason: String },
    #[error("Every candidate failed for {artifact}: {reason}")]
    Exhausted { artifact: String, reason: String },
    #[error("No candidate configurations for {0}")]
    NoCandidates(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationState {
    Uninitialized,
    InProgress,
    Ready,
    Failed,
}

enum Slot<R> {
    Uninitialized,
    InProgress,
    Ready { resource: Arc<R>, config_index: usize },
    Failed(ResourceError),
}

impl<R> Slot<R> {
    fn state(&self) -> CreationState {
        match self {
            Slot::Uninitialized => CreationState::Uninitialized,
            Slot::InProgress => CreationState::InProgress,
            Slot::Ready { .. } => CreationState::Ready,
            Slot::Failed(_) => CreationState::Failed,
        }
    }
}

struct HandleInner<F: ResourceFactory> {
    artifact: PathBuf,
    candidates: Vec<F::Config>,
    factory: Arc<F>,
    preload: AtomicBool,
    slot: Mutex<Slot<F::Resource>>,
    settled: Condvar,
    attempts: AtomicUsize,
}

/// Shared handle to one lazily built resource. Clones share the same slot.
pub struct SharedResourceHandle<F: ResourceFactory> {
    inner: Arc<HandleInner<F>>,
}

impl<F: ResourceFactory> Clone for SharedResourceHandle<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> SharedResourceHandle<F> {
    /// `candidates` are tried in order: preferred first, baseline last.
    pub fn new(artifact: impl Into<PathBuf>, candidates: Vec<F::Config>, factory: Arc<F>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                artifact: artifact.into(),
                candidates,
                factory,
                preload: AtomicBool::new(false),
                slot: Mutex::new(Slot::Uninitialized),
                settled: Condvar::new(),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Return the ready resource, constructing it first if nobody has.
    ///
    /// Blocks while another thread is constructing. A failed handle keeps
    /// returning the same error until [`invalidate`](Self::invalidate).
    pub fn get_or_create(&self) -> Result<Arc<F::Resource>, ResourceError> {
        let mut slot = self.inner.slot.lock();
        loop {
            match *slot {
                Slot::Ready { ref resource, .. } => return Ok(Arc::clone(resource)),
                Slot::Failed(ref err) => return Err(err.clone()),
                Slot::InProgress => self.inner.settled.wait(&mut slot),
                Slot::Uninitialized => {
                    *slot = Slot::InProgress;
                    let built = MutexGuard::unlocked(&mut slot, || self.construct());
                    let result = match built {
                        Ok((resource, config_index)) => {
                            *slot = Slot::Ready {
                                resource: Arc::clone(&resource),
                                config_index,
                            };
                            Ok(resource)
                        }
                        Err(err) => {
                            *slot = Slot::Failed(err.clone());
                            Err(err)
                        }
                    };
                    self.inner.settled.notify_all();
                    return result;
                }
            }
        }
    }

    /// The resource if it is already built. Never blocks on construction.
    pub fn try_get(&self) -> Option<Arc<F::Resource>> {
        match *self.inner.slot.lock() {
            Slot::Ready { ref resource, .. } => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    /// Drop the built resource (or the recorded failure) so the next
    /// `get_or_create` builds again. Callers still holding the old resource
    /// keep it alive. Returns false while construction is running or if
    /// nothing was built yet.
    pub fn invalidate(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        match *slot {
            Slot::Ready { .. } | Slot::Failed(_) => {
                *slot = Slot::Uninitialized;
                info!(artifact = %self.inner.artifact.display(), "Shared resource invalidated");
                true
            }
            Slot::Uninitialized | Slot::InProgress => false,
        }
    }

    pub fn state(&self) -> CreationState {
        self.inner.slot.lock().state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CreationState::Ready
    }

    /// Index into the candidate list of the configuration that succeeded.
    pub fn active_config_index(&self) -> Option<usize> {
        match *self.inner.slot.lock() {
            Slot::Ready { config_index, .. } => Some(config_index),
            _ => None,
        }
    }

    pub fn active_config(&self) -> Option<F::Config> {
        self.active_config_index()
            .and_then(|i| self.inner.candidates.get(i).cloned())
    }

    pub fn error(&self) -> Option<ResourceError> {
        match *self.inner.slot.lock() {
            Slot::Failed(ref err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.inner.artifact
    }

    pub fn candidates(&self) -> &[F::Config] {
        &self.inner.candidates
    }

    /// Whether the scheduler should warm this resource up after startup.
    pub fn preload(&self) -> bool {
        self.inner.preload.load(Ordering::Relaxed)
    }

    pub fn set_preload(&self, preload: bool) {
        self.inner.preload.store(preload, Ordering::Relaxed);
    }

    /// Number of factory calls made so far, across all candidates.
    pub fn construction_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// True if both handles share one slot.
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn construct(&self) -> Result<(Arc<F::Resource>, usize), ResourceError> {
        let inner = &self.inner;
        let artifact = inner.artifact.display().to_string();
        if inner.candidates.is_empty() {
            error!(artifact = %artifact, "No candidate configurations to build shared resource");
            return Err(ResourceError::NoCandidates(artifact));
        }

        let last = inner.candidates.len() - 1;
        let mut last_reason = String::new();
        for (index, config) in inner.candidates.iter().enumerate() {
            inner.attempts.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();
            let attempt = catch_unwind(AssertUnwindSafe(|| inner.factory.create(&inner.artifact, config)));
            let reason = match attempt {
                Ok(Ok(resource)) => {
                    info!(
                        artifact = %artifact,
                        config = ?config,
                        "Shared resource ready in {:?}",
                        started.elapsed()
                    );
                    return Ok((Arc::new(resource), index));
                }
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };

            if index < last {
                let err = ResourceError::Candidate {
                    config: format!("{config:?}"),
                    reason: reason.clone(),
                };
                warn!(artifact = %artifact, "{}, trying next candidate", err);
            }
            last_reason = reason;
        }

        let err = ResourceError::Exhausted {
            artifact,
            reason: last_reason,
        };
        error!("{}", err);
        Err(err)
    }
}

impl<F: ResourceFactory> fmt::Debug for SharedResourceHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResourceHandle")
            .field("artifact", &self.inner.artifact)
            .field("state", &self.state())
            .field("candidates", &self.inner.candidates)
            .finish()
    }
}

/// One [`SharedResourceHandle`] per artifact identity.
pub struct ResourcePool<F: ResourceFactory> {
    factory: Arc<F>,
    candidates: Vec<F::Config>,
    preload: bool,
    handles: Mutex<HashMap<PathBuf, SharedResourceHandle<F>>>,
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, candidates: Vec<F::Config>) -> Self {
        Self {
            factory: Arc::new(factory),
            candidates,
            preload: false,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Mark every handle created from now on for warm-up.
    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    /// The handle for `artifact`, created on first request.
    pub fn handle(&self, artifact: impl AsRef<Path>) -> SharedResourceHandle<F> {
        let artifact = artifact.as_ref();
        self.handles
            .lock()
            .entry(artifact.to_path_buf())
            .or_insert_with(|| {
                let handle = SharedResourceHandle::new(artifact, self.candidates.clone(), Arc::clone(&self.factory));
                handle.set_preload(self.preload);
                handle
            })
            .clone()
    }

    /// Handles marked for warm-up.
    pub fn preloaded(&self) -> Vec<SharedResourceHandle<F>> {
        self.handles.lock().values().filter(|h| h.preload()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl<F> ResourcePool<F>
where
    F: ResourceFactory<Config = String>,
{
    /// Pool whose candidates and preload flag come from `[resources]`.
    pub fn from_config(factory: F, config: &ResourceConfig) -> Self {
        Self::new(factory, config.candidate_configs.clone()).with_preload(config.preload)
    }
}

impl<F: ResourceFactory> fmt::Debug for ResourcePool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("handles", &self.len())
            .field("candidates", &self.candidates)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;

    #[derive(Debug)]
    struct Model {
        config: String,
    }

    /// Fails for every config listed in `failing`, counting successful builds.
    struct FakeFactory {
        failing: Mutex<Vec<String>>,
        built: AtomicUsize,
        build_time: Duration,
    }

    impl FakeFactory {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: Mutex::new(failing.iter().map(|s| s.to_string()).collect()),
                built: AtomicUsize::new(0),
                build_time: Duration::ZERO,
            }
        }
    }

    impl ResourceFactory for FakeFactory {
        type Resource = Model;
        type Config = String;
        type Error = String;

        fn create(&self, artifact: &Path, config: &String) -> Result<Model, String> {
            thread::sleep(self.build_time);
            if config == "panic" {
                panic!("driver crashed");
            }
            if self.failing.lock().contains(config) {
                return Err(format!("{config} unavailable for {}", artifact.display()));
            }
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Model {
                config: config.clone(),
            })
        }
    }

    fn handle(factory: FakeFactory, candidates: &[&str]) -> (SharedResourceHandle<FakeFactory>, Arc<FakeFactory>) {
        let factory = Arc::new(factory);
        let candidates = candidates.iter().map(|s| s.to_string()).collect();
        let handle = SharedResourceHandle::new("models/bone-age.onnx", candidates, Arc::clone(&factory));
        (handle, factory)
    }

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn concurrent_first_use_builds_once() {
        let mut factory = FakeFactory::new(&[]);
        factory.build_time = Duration::from_millis(50);
        let (handle, factory) = handle(factory, &["cuda"]);
        let barrier = Arc::new(Barrier::new(50));

        let threads: Vec<_> = (0..50)
            .map(|_| {
                let handle = handle.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    handle.get_or_create().unwrap()
                })
            })
            .collect();
        let models: Vec<Arc<Model>> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(handle.construction_attempts(), 1);
        assert!(models.iter().all(|m| Arc::ptr_eq(m, &models[0])));
        assert!(handle.is_ready());
    }

    #[test]
    fn falls_back_to_next_candidate_with_one_warning() {
        let (handle, _factory) = handle(FakeFactory::new(&["cuda"]), &["cuda", "cpu"]);
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));

        let model = tracing::subscriber::with_default(subscriber, || handle.get_or_create()).unwrap();

        assert_eq!(model.config, "cpu");
        assert_eq!(handle.state(), CreationState::Ready);
        assert_eq!(handle.active_config_index(), Some(1));
        assert_eq!(handle.active_config().as_deref(), Some("cpu"));
        assert_eq!(warnings.load(Ordering::SeqCst), 1);

        let again = handle.get_or_create().unwrap();
        assert!(Arc::ptr_eq(&model, &again));
        assert_eq!(handle.construction_attempts(), 2);
    }

    #[test]
    fn final_candidate_failure_is_sticky_until_invalidated() {
        let (handle, factory) = handle(FakeFactory::new(&["cuda", "cpu"]), &["cuda", "cpu"]);

        let err = handle.get_or_create().unwrap_err();
        assert!(matches!(err, ResourceError::Exhausted { .. }));
        assert_eq!(handle.state(), CreationState::Failed);
        assert_eq!(handle.get_or_create().unwrap_err(), err);
        assert_eq!(handle.construction_attempts(), 2);

        factory.failing.lock().clear();
        assert!(handle.invalidate());
        assert_eq!(handle.state(), CreationState::Uninitialized);
        assert_eq!(handle.get_or_create().unwrap().config, "cuda");
        assert_eq!(handle.construction_attempts(), 3);
    }

    #[test]
    fn invalidate_rebuilds_while_old_resource_lives() {
        let (handle, factory) = handle(FakeFactory::new(&[]), &["cpu"]);
        assert!(!handle.invalidate());

        let first = handle.get_or_create().unwrap();
        assert!(handle.invalidate());
        assert!(handle.try_get().is_none());

        let second = handle.get_or_create().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.config, "cpu");
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_refused_while_construction_runs() {
        let mut factory = FakeFactory::new(&[]);
        factory.build_time = Duration::from_millis(150);
        let (handle, factory) = handle(factory, &["cpu"]);

        let builder = {
            let handle = handle.clone();
            thread::spawn(move || handle.get_or_create().map(|m| m.config.clone()))
        };
        while handle.state() == CreationState::Uninitialized {
            thread::yield_now();
        }

        assert_eq!(handle.state(), CreationState::InProgress);
        assert!(!handle.invalidate());
        assert_eq!(handle.state(), CreationState::InProgress);
        assert_eq!(builder.join().unwrap().as_deref(), Ok("cpu"));
        assert!(handle.is_ready());
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_candidate_counts_as_failure() {
        let (handle, _factory) = handle(FakeFactory::new(&[]), &["panic", "cpu"]);
        assert_eq!(handle.get_or_create().unwrap().config, "cpu");
        assert_eq!(handle.active_config_index(), Some(1));
    }

    #[test]
    fn empty_candidate_list_fails() {
        let (handle, _factory) = handle(FakeFactory::new(&[]), &[]);
        assert_eq!(
            handle.get_or_create().unwrap_err(),
            ResourceError::NoCandidates("models/bone-age.onnx".into())
        );
    }

    #[test]
    fn pool_shares_one_handle_per_artifact() {
        let config = ResourceConfig {
            candidate_configs: vec!["cpu".into()],
            preload: true,
        };
        let pool = ResourcePool::from_config(FakeFactory::new(&[]), &config);

        let a = pool.handle("models/retina.onnx");
        let b = pool.handle("models/retina.onnx");
        let c = pool.handle("models/bone-age.onnx");
        assert!(a.same_handle(&b));
        assert!(!a.same_handle(&c));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.preloaded().len(), 2);

        let from_a = a.get_or_create().unwrap();
        assert!(Arc::ptr_eq(&from_a, &b.try_get().unwrap()));
        assert_eq!(b.construction_attempts(), 1);
    }
}
