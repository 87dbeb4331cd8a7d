//! Minimal observer list with synchronous dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Identifies one subscription. Unique across every [`Signal`] in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A list of handlers invoked in subscription order by [`Signal::emit`].
pub struct Signal<A> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<A>)>>,
}

impl<A> Signal<A> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&A) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns false if `id` was not subscribed to this signal.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    /// Call every handler with `args`.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe while the signal is being emitted.
    pub fn emit(&self, args: &A) {
        let snapshot: Vec<Handler<A>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(args);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
