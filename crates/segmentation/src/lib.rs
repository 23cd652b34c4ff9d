//! Membership lifecycle engine: reconciles requested segment changes
//! against current state, writes the audit trail, schedules and executes
//! time-limited memberships, and enrolls random cohorts into new segments.

pub mod audit;
mod call;
pub mod diff;
pub mod lock;
pub mod sampler;
pub mod scheduler;
pub mod service;
pub mod ticker;
pub mod worker;

pub use audit::{AuditKinds, AuditRecorder};
pub use diff::MembershipDiff;
pub use lock::UserLocks;
pub use sampler::CohortSampler;
pub use scheduler::ExpiryScheduler;
pub use service::{
    AuditOutcome, CreateSegment, MembershipChange, MembershipService, SegmentCreated,
    SegmentDeleted, SegmentService, SetSegments,
};
pub use ticker::{IntervalTicker, ManualTicker, TickHandle, Ticker};
pub use worker::{CycleReport, CycleState, ExpiryWorker, WorkerStatus};
