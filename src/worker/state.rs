//! Agent state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::tasks::{TaskId, WorkerId};

/// Cap on the transition history kept per agent.
const MAX_TRANSITIONS: usize = 200;

/// State of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// No worker id yet.
    Unregistered,
    /// Holds a worker id; heartbeats have started.
    Registered,
    /// Polling for work.
    Idle,
    /// Holds a lease that has not been acknowledged.
    Leased,
    /// Running a task.
    Executing,
}

impl AgentState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: AgentState) -> bool {
        use AgentState::*;

        matches!(
            (self, target),
            (Unregistered, Registered)
                | (Registered, Idle)
                | (Idle, Leased)
                | (Leased, Executing)
                // Acknowledge rejected, task abandoned
                | (Leased, Idle)
                | (Executing, Idle)
        )
    }

    /// Whether the agent currently holds a task.
    pub fn holds_task(&self) -> bool {
        matches!(self, Self::Leased | Self::Executing)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Idle => "idle",
            Self::Leased => "leased",
            Self::Executing => "executing",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// What happened to a task the agent held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    /// Ownership lost or reporting gave up; the coordinator will redeliver.
    Abandoned,
}

/// Running state of one agent: identity, current task, counters and history.
#[derive(Debug, Clone, Serialize)]
pub struct AgentContext {
    pub worker_id: Option<WorkerId>,
    pub state: AgentState,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_abandoned: u64,
    pub started_at: DateTime<Utc>,
    pub transitions: Vec<StateTransition>,
}

impl AgentContext {
    pub fn new() -> Self {
        Self {
            worker_id: None,
            state: AgentState::Unregistered,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_abandoned: 0,
            started_at: Utc::now(),
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: AgentState,
        reason: Option<String>,
    ) -> Result<(), AgentError> {
        if !self.state.can_transition_to(new_state) {
            return Err(AgentError::InvalidTransition {
                from: self.state.to_string(),
                to: new_state.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        if !new_state.holds_task() {
            self.current_task = None;
        }
        Ok(())
    }

    pub fn registered(&mut self, worker_id: WorkerId) -> Result<(), AgentError> {
        self.transition_to(AgentState::Registered, None)?;
        self.worker_id = Some(worker_id);
        Ok(())
    }

    pub fn leased(&mut self, task_id: TaskId) -> Result<(), AgentError> {
        self.transition_to(AgentState::Leased, Some(format!("task {task_id}")))?;
        self.current_task = Some(task_id);
        Ok(())
    }

    /// Return to `Idle`, counting how the held task ended.
    pub fn finish_task(&mut self, outcome: TaskOutcome) -> Result<(), AgentError> {
        let reason = format!("{outcome:?}").to_lowercase();
        self.transition_to(AgentState::Idle, Some(reason))?;
        match outcome {
            TaskOutcome::Completed => self.tasks_completed += 1,
            TaskOutcome::Failed => self.tasks_failed += 1,
            TaskOutcome::Abandoned => self.tasks_abandoned += 1,
        }
        Ok(())
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new()
    }
}
