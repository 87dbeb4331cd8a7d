use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::pool::TierMetrics;

/// Scheduler operational metrics exposed to the UI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Total tasks executed by name.
    pub tasks_executed: HashMap<String, u64>,
    /// Tasks whose body returned an error or panicked, by name.
    pub tasks_failed: HashMap<String, u64>,
    /// Average task duration by task name.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Last execution time by task name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Tasks started but not yet released.
    pub running_tasks: usize,
    pub general: Option<TierMetrics>,
    /// `None` when the exclusive tier is disabled.
    pub exclusive: Option<TierMetrics>,
}

impl SchedulerMetrics {
    /// Record a task execution.
    pub fn record_execution(&mut self, task_name: &str, duration: Duration) {
        *self.tasks_executed.entry(task_name.to_string()).or_default() += 1;
        self.last_run
            .insert(task_name.to_string(), Utc::now());

        // Update rolling average duration
        let count = self.tasks_executed[task_name];
        let prev_avg = self
            .avg_task_duration
            .get(task_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration
            .insert(task_name.to_string(), new_avg);
    }

    pub fn record_failure(&mut self, task_name: &str) {
        *self.tasks_failed.entry(task_name.to_string()).or_default() += 1;
    }

    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.tasks_failed.values().sum()
    }
}
