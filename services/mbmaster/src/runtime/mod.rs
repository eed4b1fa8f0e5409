//! Runtime building blocks: per-connection scheduling and reconnect policy

pub mod reconnect;
pub mod scheduler;

pub use reconnect::{ReconnectPolicy, RetryBackoff};
pub use scheduler::{Delivery, RunGuard, Scheduler, TaskId};
