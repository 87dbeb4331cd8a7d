//! Optional process-wide default scheduler.
//!
//! Components that are handed a [`Scheduler`] explicitly should keep using
//! it; this exists for call sites that have no way to receive one.

use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::scheduler::Scheduler;

static DEFAULT: OnceLock<Arc<Scheduler>> = OnceLock::new();

/// Install `scheduler` as the default. Only the first call succeeds; later
/// calls hand their scheduler back.
pub fn install(scheduler: Arc<Scheduler>) -> Result<(), Arc<Scheduler>> {
    DEFAULT.set(scheduler).inspect_err(|_| {
        warn!("Default scheduler already installed");
    })
}

/// The installed default, if any.
pub fn get() -> Option<Arc<Scheduler>> {
    DEFAULT.get().cloned()
}
