//! task-runner: drives the scheduler with a synthetic workload.
//!
//! Submits a batch of general "slice loading" tasks and exclusive
//! "inference" tasks that share one simulated model, mirrors them in a
//! `TaskRegistry`, and drains the owning event loop until the registry has
//! evicted every finished task. Prints the scheduler metrics as JSON.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::Parser;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use vision_compute::{
    EventLoop, ResourceClass, ResourceFactory, ResourcePool, Scheduler, Task, TaskError,
    TaskRegistry,
};
use vision_core::config::load_dotenv;
use vision_core::Config;

/// Voxels each simulated inference step normalizes in parallel.
const VOXELS_PER_STEP: usize = 64 * 64;

// ── CLI ─────────────────────────────────────────────────────────────

/// Synthetic workload for the two-tier task scheduler.
#[derive(Parser, Debug)]
#[command(name = "task-runner", version, about)]
struct Cli {
    /// Path to a TOML config file. Falls back to environment variables.
    #[arg(long, env = "VISION_CONFIG")]
    config: Option<PathBuf>,

    /// Model artifact the inference tasks share.
    #[arg(long, default_value = "models/bone-age.onnx")]
    model: PathBuf,

    /// Number of general-tier tasks.
    #[arg(long, default_value_t = 6)]
    general_tasks: usize,

    /// Number of exclusive-tier inference tasks.
    #[arg(long, default_value_t = 3)]
    exclusive_tasks: usize,

    /// Progress steps per task.
    #[arg(long, default_value_t = 10)]
    steps: usize,

    /// Milliseconds each step takes.
    #[arg(long, default_value_t = 20)]
    step_ms: u64,

    /// Milliseconds the simulated model takes to load.
    #[arg(long, default_value_t = 300)]
    model_load_ms: u64,

    /// Make the preferred candidate configuration fail to exercise fallback.
    #[arg(long)]
    fail_first_candidate: bool,

    /// Give up draining after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

// ── Simulated model ─────────────────────────────────────────────────

struct SimulatedModel {
    config: String,
    scale: f64,
}

struct SimulatedModelFactory {
    failing_config: Option<String>,
    load_time: Duration,
}

impl ResourceFactory for SimulatedModelFactory {
    type Resource = SimulatedModel;
    type Config = String;
    type Error = String;

    fn create(&self, artifact: &Path, config: &String) -> Result<SimulatedModel, String> {
        info!(artifact = %artifact.display(), config = %config, "loading model");
        thread::sleep(self.load_time);
        if self.failing_config.as_ref() == Some(config) {
            return Err(format!("execution provider '{config}' is not available"));
        }
        Ok(SimulatedModel {
            config: config.clone(),
            scale: 0.5,
        })
    }
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    load_dotenv();

    let config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => {
                info!(path = %path.display(), "loaded config");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load config, using environment");
                Config::from_env()?
            }
        },
        None => Config::from_env()?,
    };
    config.log_summary();

    let event_loop = EventLoop::new();
    let scheduler = Scheduler::new(&config.scheduler, event_loop.handle())?;
    let registry = TaskRegistry::new(&config.registry, event_loop.handle())?;

    registry.item_added().subscribe(|e| {
        info!(task = %e.task.id(), index = e.index, "[+] {}", e.task.name());
    });
    registry.item_removed().subscribe(|e| {
        info!(task = %e.task.id(), index = e.index, "[-] {}", e.task.name());
    });

    let factory = SimulatedModelFactory {
        failing_config: cli
            .fail_first_candidate
            .then(|| config.resources.candidate_configs.first().cloned())
            .flatten(),
        load_time: Duration::from_millis(cli.model_load_ms),
    };
    let pool = ResourcePool::from_config(factory, &config.resources);
    let model = pool.handle(&cli.model);
    scheduler.warm_up_if_preloaded(&model);

    let steps = cli.steps;
    let step_time = Duration::from_millis(cli.step_ms);

    for i in 0..cli.general_tasks {
        let task = Task::new(format!("load-slice-{i}"), ResourceClass::General, event_loop.handle());
        let id = task.id();
        task.on_progress_changed(move |p| debug!(task = %id, progress = *p, "progress"));
        registry.add(task.view());

        scheduler.run_task(&task, move |progress| {
            for step in 1..=steps {
                thread::sleep(step_time);
                progress.step(step, steps);
            }
            Ok::<_, TaskError>(steps * 512)
        });
        task.attach_callback(move |outcome| match outcome {
            Ok(bytes) => info!(task = %id, bytes, "slice loaded"),
            Err(e) => warn!(task = %id, error = %e, "slice failed"),
        });
    }

    for i in 0..cli.exclusive_tasks {
        let task = scheduler.submit_compute(format!("infer-{i}"), &model, move |model: &SimulatedModel, progress| {
            progress.set_indeterminate();
            let voxels: Vec<f64> = (0..VOXELS_PER_STEP).map(|v| (v % 256) as f64 / 255.0).collect();
            let mut score = 0.0;
            for step in 1..=steps {
                thread::sleep(step_time);
                let mean = voxels.par_iter().map(|v| v * model.scale).sum::<f64>() / voxels.len() as f64;
                score += mean / steps as f64;
                progress.step(step, steps);
            }
            Ok::<_, TaskError>((score, model.config.clone()))
        });
        let id = task.id();
        registry.add(task.view());
        task.attach_callback(move |outcome| match outcome {
            Ok((score, config)) => info!(task = %id, score, config = %config, "inference finished"),
            Err(e) => warn!(task = %id, error = %e, "inference failed"),
        });
    }

    let timeout = Duration::from_secs(cli.timeout_secs);
    let drained = event_loop.run_until(|| registry.is_empty() && scheduler.running_count() == 0, timeout);
    if !drained {
        warn!(remaining = registry.len(), "timed out waiting for tasks");
    }

    info!(
        state = ?model.state(),
        config = ?model.active_config(),
        attempts = model.construction_attempts(),
        "model summary"
    );
    println!("{}", serde_json::to_string_pretty(&scheduler.metrics())?);
    Ok(())
}
