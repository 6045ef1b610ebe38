//! Worker system: the client half of the lease protocol.
//!
//! Core components:
//! - `state`: Agent state machine (Unregistered → Registered → Idle ⇄ Leased → Executing)
//! - `client`: `CoordinatorApi` over HTTP or in-process
//! - `executor`: Pluggable task execution
//! - `backoff`: Capped exponential retry delays
//! - `agent`: Registration, heartbeat, and the fetch/ack/execute/complete loop

pub mod agent;
pub mod backoff;
pub mod client;
pub mod executor;
pub mod state;

pub use agent::{WorkerAgent, spawn_heartbeat_loop};
pub use client::{CoordinatorApi, HttpCoordinator};
pub use executor::{SimulatedExecutor, TaskExecutor};
pub use state::{AgentContext, AgentState, TaskOutcome};
