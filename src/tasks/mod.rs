//! Task system: records, wire types, and the ready queue.

pub mod model;
pub mod queue;

pub use model::{Completion, Task, TaskId, TaskStatus, Worker, WorkerId, WorkerStatus};
pub use queue::ReadyQueue;
