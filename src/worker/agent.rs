//! Worker agent: registers, heartbeats, and runs the fetch → acknowledge →
//! execute → complete cycle against a coordinator.
//!
//! Any task whose lease or ownership is lost is dropped without reporting; the
//! coordinator redelivers it to someone else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, delay_for_attempt};
use super::client::CoordinatorApi;
use super::executor::TaskExecutor;
use super::state::{AgentContext, AgentState, TaskOutcome};
use crate::config::AgentConfig;
use crate::error::{AgentError, DispatchError};
use crate::tasks::{Completion, Task, WorkerId};

pub struct WorkerAgent {
    api: Arc<dyn CoordinatorApi>,
    executor: Arc<dyn TaskExecutor>,
    config: AgentConfig,
    ctx: AgentContext,
    shutdown: Arc<AtomicBool>,
}

impl WorkerAgent {
    pub fn new(
        api: Arc<dyn CoordinatorApi>,
        executor: Arc<dyn TaskExecutor>,
        config: AgentConfig,
    ) -> Self {
        Self {
            api,
            executor,
            config,
            ctx: AgentContext::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops `run` before its next fetch.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    fn worker_id(&self) -> Result<WorkerId, AgentError> {
        self.ctx.worker_id.ok_or(AgentError::InvalidTransition {
            from: self.ctx.state.to_string(),
            to: AgentState::Idle.to_string(),
        })
    }

    /// Register with bounded retries and capped exponential backoff.
    pub async fn register(&mut self) -> Result<WorkerId, AgentError> {
        let attempts = self.config.max_register_attempts;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.api.register().await {
                Ok(worker_id) => {
                    self.ctx.registered(worker_id)?;
                    info!(worker_id, "Registered with coordinator");
                    return Ok(worker_id);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 == attempts {
                        break;
                    }
                    let delay = delay_for_attempt(
                        self.config.register_backoff_base,
                        self.config.register_backoff_max,
                        attempt,
                    );
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Registration failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        error!(attempts, error = %last_error, "Registration failed, giving up");
        Err(AgentError::RegistrationExhausted {
            attempts,
            last_error,
        })
    }

    /// Register, start heartbeating, and process tasks until shut down.
    ///
    /// Returns the final agent context.
    pub async fn run(mut self) -> Result<AgentContext, AgentError> {
        let worker_id = self.register().await?;
        let (heartbeat, heartbeat_stop) =
            spawn_heartbeat_loop(Arc::clone(&self.api), worker_id, self.config.heartbeat_interval);
        self.ctx.transition_to(AgentState::Idle, None)?;

        let mut poll = Backoff::new(self.config.poll_min, self.config.poll_max);
        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }
            match self.poll_once().await {
                Ok(Some(_)) => poll.reset(),
                Ok(None) => tokio::time::sleep(poll.next_delay()).await,
                Err(e) => break Err(e),
            }
        };

        heartbeat_stop.store(true, Ordering::Relaxed);
        heartbeat.abort();
        info!(
            worker_id,
            completed = self.ctx.tasks_completed,
            failed = self.ctx.tasks_failed,
            abandoned = self.ctx.tasks_abandoned,
            "Worker agent stopped"
        );
        result.map(|_| self.ctx)
    }

    /// One fetch attempt from `Idle`. Returns the outcome if a task was handled,
    /// `None` if there was nothing to do and the caller should back off.
    pub async fn poll_once(&mut self) -> Result<Option<TaskOutcome>, AgentError> {
        let worker_id = self.worker_id()?;

        let task = match self.api.fetch(worker_id).await {
            Ok(task) => task,
            Err(AgentError::Dispatch(DispatchError::QueueEmpty)) => {
                debug!(worker_id, "No tasks available");
                return Ok(None);
            }
            Err(AgentError::Dispatch(DispatchError::Conflict(reason))) => {
                // Marked failed by the coordinator; the next heartbeat rejoins.
                warn!(worker_id, %reason, "Fetch rejected");
                return Ok(None);
            }
            Err(e) if e.is_transient() => {
                warn!(worker_id, error = %e, "Fetch failed, backing off");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let outcome = self.handle(worker_id, task).await?;
        Ok(Some(outcome))
    }

    /// Acknowledge, execute, and report a leased task. Always ends `Idle`.
    async fn handle(&mut self, worker_id: WorkerId, task: Task) -> Result<TaskOutcome, AgentError> {
        let task_id = task.id;
        self.ctx.leased(task_id)?;
        info!(task_id, worker_id, description = %task.description, "Task leased");

        if let Err(e) = self.api.acknowledge(task_id, worker_id).await {
            warn!(task_id, worker_id, error = %e, "Acknowledge failed, abandoning task");
            self.ctx.finish_task(TaskOutcome::Abandoned)?;
            return Ok(TaskOutcome::Abandoned);
        }
        self.ctx.transition_to(AgentState::Executing, None)?;

        let completion = match self.executor.execute(&task).await {
            Ok(result) => Completion::Succeeded(result),
            Err(e) => Completion::Failed(e.to_string()),
        };

        let outcome = self.report(&task, worker_id, &completion).await;
        self.ctx.finish_task(outcome)?;
        Ok(outcome)
    }

    /// Send the final report, retrying transient failures.
    async fn report(&self, task: &Task, worker_id: WorkerId, completion: &Completion) -> TaskOutcome {
        let attempts = self.config.max_complete_attempts.max(1);

        for attempt in 0..attempts {
            match self.api.complete(task.id, worker_id, completion).await {
                Ok(stored) => {
                    info!(task_id = task.id, worker_id, status = %stored.status, "Task reported");
                    return match completion {
                        Completion::Failed(_) => TaskOutcome::Failed,
                        _ => TaskOutcome::Completed,
                    };
                }
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = delay_for_attempt(self.config.poll_min, self.config.poll_max, attempt);
                    warn!(task_id = task.id, attempt = attempt + 1, error = %e, "Report failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    // The task stays `processing` under this live worker; nothing reclaims it.
                    error!(
                        task_id = task.id,
                        worker_id,
                        attempts,
                        error = %e,
                        "Report retries exhausted, task left processing"
                    );
                    return TaskOutcome::Abandoned;
                }
                Err(e) => {
                    warn!(task_id = task.id, worker_id, error = %e, "Report rejected, abandoning task");
                    return TaskOutcome::Abandoned;
                }
            }
        }
        TaskOutcome::Abandoned
    }
}

/// Spawn the heartbeat loop for `worker_id`.
///
/// Returns a `JoinHandle` and a shutdown flag. Errors are logged and the loop
/// keeps going.
pub fn spawn_heartbeat_loop(
    api: Arc<dyn CoordinatorApi>,
    worker_id: WorkerId,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        debug!(worker_id, interval_ms = interval.as_millis() as u64, "Heartbeat loop started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = api.heartbeat(worker_id).await {
                warn!(worker_id, error = %e, "Heartbeat failed");
            }
        }
    });

    (handle, shutdown_flag)
}
