//! The update loop and its policies.

pub mod controller;
mod loop_worker;
mod policy;

pub use controller::SchedulerController;
pub use loop_worker::UpdateScheduler;
pub use policy::{BackoffPolicy, Jitter, UpdatePolicy};
