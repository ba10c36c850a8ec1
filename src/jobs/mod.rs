//! Job queue: types, rate limiting and the scheduler.

pub mod limiter;
pub mod scheduler;
pub mod types;

pub use limiter::{SourceLimiters, TokenBucket};
pub use scheduler::{Scheduler, StatusSnapshot};
pub use types::{
    CancelMode, CancelScope, Job, JobId, JobInput, JobKind, JobState, Milestones, Priority,
    Target, TargetKind,
};
