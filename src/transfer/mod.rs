//! Transfer engine
//!
//! - [`engine::TransferEngine`] - plans and runs upload, download and delete jobs
//! - [`job`] - job snapshots, progress events, handles and cancellation
//! - [`edit::EditSession`] - local working copy of one object, synced back on change

pub mod edit;
pub mod engine;
pub mod job;

pub use edit::EditSession;
pub use engine::{TransferEngine, TransferRequest};
pub use job::{
    CancelFlag, JobEvent, JobHandle, JobId, JobReport, JobState, TransferJob, TransferKind,
    TransferUnit, UnitOutcome,
};
