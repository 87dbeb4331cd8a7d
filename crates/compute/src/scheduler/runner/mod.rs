//! Scheduler runner -- owns the worker tiers and the running-task set.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, tier routing, and accessor methods
//! - `execution`: task submission, body wrapping, and delayed jobs

mod core;
mod execution;

pub use self::core::Scheduler;
