//! Task execution: pluggable work performed between acknowledge and complete.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use crate::tasks::Task;

/// Runs a leased task. `Ok` carries the result text, `Err` the failure reason
/// reported back to the coordinator.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> anyhow::Result<String>;
}

/// Demo executor: sleeps for a random number of steps and fails at a fixed rate.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    label: String,
    step: Duration,
    max_steps: u32,
    failure_rate: f64,
}

impl SimulatedExecutor {
    /// One to ten one-second steps.
    pub fn new(label: impl Into<String>, failure_rate: f64) -> Self {
        Self {
            label: label.into(),
            step: Duration::from_secs(1),
            max_steps: 10,
            failure_rate: if failure_rate.is_nan() {
                0.0
            } else {
                failure_rate.clamp(0.0, 1.0)
            },
        }
    }

    /// Override the step length and count.
    pub fn with_steps(mut self, step: Duration, max_steps: u32) -> Self {
        self.step = step;
        self.max_steps = max_steps.max(1);
        self
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task) -> anyhow::Result<String> {
        // ThreadRng is not Send; draw everything before the first await.
        let (steps, fail) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(1..=self.max_steps),
                rng.gen_bool(self.failure_rate),
            )
        };

        for i in 1..=steps {
            tokio::time::sleep(self.step).await;
            debug!(task_id = task.id, step = i, steps, "Processing");
        }

        let elapsed = self.step * steps;
        if fail {
            info!(task_id = task.id, "Simulated failure");
            anyhow::bail!("simulated failure in {} after {elapsed:?}", self.label);
        }
        Ok(format!(
            "Successfully processed by {} in {elapsed:?}",
            self.label
        ))
    }
}
