pub mod execution;
pub mod job;
pub mod master;

pub use execution::{ExecutionAttemptId, TaskExecution, TaskStatus};
pub use job::{JobId, JobOutcome, JobRecord, JobStatus};
pub use master::{JobControl, JobMaster};
