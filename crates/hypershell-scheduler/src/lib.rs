//! Ready-queue, lease table, promoter and reaper (spec section 4.3).

pub mod error;
pub mod lease;
pub mod scheduler;

pub use error::SchedulerError;
pub use lease::Lease;
pub use scheduler::Scheduler;
