//! taskgrid: task dispatch coordinator and worker agent.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod store;
pub mod tasks;
pub mod worker;
