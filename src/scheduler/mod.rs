//! Work distribution across the broker fleet.
//!
//! - [`Dispatcher`]: claims the head of each FIFO queue for this node
//! - [`LivenessMonitor`]: heartbeats and recovery of jobs held by dead nodes
//! - [`job`]: the job record and its status lifecycle

pub mod dispatcher;
pub mod job;
pub mod liveness;
pub mod timer;

pub use dispatcher::Dispatcher;
pub use job::{Job, JobStatus};
pub use liveness::{CycleReport, LivenessMonitor};
