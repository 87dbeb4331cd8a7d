pub mod config;
pub mod error;

pub use config::{Config, RegistryConfig, ResourceConfig, SchedulerConfig};
pub use error::*;
