use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VisionError, VisionResult};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Number of hardware threads, or 4 when it cannot be determined.
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Config {
    /// Build config from defaults plus environment variables (call `load_dotenv()` first).
    /// Profile is read from `VISION_PROFILE`. When set (e.g. `WORKSTATION`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> VisionResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> VisionResult<Self> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> VisionResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `VISION_MAX_GENERAL_THREADS` → `scheduler.max_general_threads`
    /// - `VISION_MAX_EXCLUSIVE_THREADS` → `scheduler.max_exclusive_threads`
    /// - `VISION_WARM_UP_DELAY_MS` → `scheduler.warm_up_delay_ms`
    /// - `VISION_FINISHED_TASK_REMOVAL_DELAY_MS` → `registry.finished_task_removal_delay_ms`
    /// - `VISION_RESOURCE_CANDIDATE_CONFIGS` → `resources.candidate_configs` (comma-separated)
    /// - `VISION_RESOURCE_PRELOAD` → `resources.preload`
    fn apply_env_overrides(&mut self) {
        let profile = env_opt("VISION_PROFILE")
            .map(|p| p.to_uppercase())
            .unwrap_or_else(|| self.profile.to_uppercase());
        self.profile = profile.clone();
        self.apply_overrides(|key| profiled_env_opt(&profile, key));
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VISION_MAX_GENERAL_THREADS") {
            match v.parse::<usize>() {
                Ok(n) => self.scheduler.max_general_threads = Some(n),
                Err(_) => tracing::warn!(value = %v, "ignoring invalid VISION_MAX_GENERAL_THREADS"),
            }
        }
        if let Some(v) = lookup("VISION_MAX_EXCLUSIVE_THREADS") {
            match v.parse::<usize>() {
                Ok(n) => self.scheduler.max_exclusive_threads = n,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid VISION_MAX_EXCLUSIVE_THREADS"),
            }
        }
        if let Some(v) = lookup("VISION_WARM_UP_DELAY_MS") {
            match v.parse::<u64>() {
                Ok(n) => self.scheduler.warm_up_delay_ms = n,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid VISION_WARM_UP_DELAY_MS"),
            }
        }
        if let Some(v) = lookup("VISION_FINISHED_TASK_REMOVAL_DELAY_MS") {
            match v.parse::<u64>() {
                Ok(n) => self.registry.finished_task_removal_delay_ms = n,
                Err(_) => tracing::warn!(
                    value = %v,
                    "ignoring invalid VISION_FINISHED_TASK_REMOVAL_DELAY_MS"
                ),
            }
        }
        if let Some(v) = lookup("VISION_RESOURCE_CANDIDATE_CONFIGS") {
            self.resources.candidate_configs = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("VISION_RESOURCE_PRELOAD") {
            self.resources.preload = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> VisionResult<()> {
        if self.resources.candidate_configs.is_empty() {
            return Err(VisionError::InvalidConfig(
                "resources.candidate_configs must name at least one configuration".into(),
            ));
        }
        if self.scheduler.max_general_threads == Some(0) {
            return Err(VisionError::InvalidConfig(
                "scheduler.max_general_threads must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   general={}, exclusive={}, warm_up={}ms",
            self.scheduler.resolved_general_threads(),
            self.scheduler.resolved_exclusive_threads(),
            self.scheduler.warm_up_delay_ms
        );
        tracing::info!(
            "  registry:    removal_delay={}ms",
            self.registry.finished_task_removal_delay_ms
        );
        tracing::info!(
            "  resources:   candidates=[{}], preload={}",
            self.resources.candidate_configs.join(", "),
            self.resources.preload
        );
    }

    /// Return a JSON view of the resolved configuration.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "scheduler": {
                "general_threads": self.scheduler.resolved_general_threads(),
                "exclusive_threads": self.scheduler.resolved_exclusive_threads(),
                "warm_up_delay_ms": self.scheduler.warm_up_delay_ms,
            },
            "registry": {
                "finished_task_removal_delay_ms": self.registry.finished_task_removal_delay_ms,
            },
            "resources": {
                "candidate_configs": self.resources.candidate_configs,
                "preload": self.resources.preload,
            },
        })
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Worker tier sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// General tier size. `None` = hardware concurrency minus exclusive tier.
    #[serde(default)]
    pub max_general_threads: Option<usize>,
    /// Exclusive tier size. 0 disables the tier; exclusive work then runs on the general tier.
    #[serde(default = "default_exclusive_threads")]
    pub max_exclusive_threads: usize,
    /// Delay before a preloaded resource is warmed up in the background.
    #[serde(default = "default_warm_up_delay")]
    pub warm_up_delay_ms: u64,
}

fn default_exclusive_threads() -> usize { 1 }
fn default_warm_up_delay() -> u64 { 1500 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_general_threads: None,
            max_exclusive_threads: default_exclusive_threads(),
            warm_up_delay_ms: default_warm_up_delay(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve the general tier size against this machine's hardware concurrency.
    pub fn resolved_general_threads(&self) -> usize {
        self.general_threads_for(hardware_concurrency())
    }

    /// Resolve the general tier size for a given hardware concurrency (floor 1).
    pub fn general_threads_for(&self, hardware_threads: usize) -> usize {
        self.max_general_threads
            .unwrap_or_else(|| hardware_threads.saturating_sub(self.max_exclusive_threads))
            .max(1)
    }

    pub fn resolved_exclusive_threads(&self) -> usize {
        self.max_exclusive_threads
    }

    pub fn warm_up_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.warm_up_delay_ms)
    }
}

// ── Registry ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How long a finished task stays visible before it is evicted.
    #[serde(default = "default_removal_delay")]
    pub finished_task_removal_delay_ms: u64,
}

fn default_removal_delay() -> u64 { 2000 }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            finished_task_removal_delay_ms: default_removal_delay(),
        }
    }
}

impl RegistryConfig {
    pub fn removal_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.finished_task_removal_delay_ms)
    }
}

// ── Shared resources ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Construction configurations, preferred first, baseline last.
    #[serde(default = "default_candidate_configs")]
    pub candidate_configs: Vec<String>,
    /// Warm the resource up in the background shortly after startup.
    #[serde(default)]
    pub preload: bool,
}

fn default_candidate_configs() -> Vec<String> {
    vec!["cuda".to_string(), "cpu".to_string()]
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            candidate_configs: default_candidate_configs(),
            preload: false,
        }
    }
}
