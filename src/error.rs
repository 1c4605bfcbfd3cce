use std::time::Duration;

use thiserror::Error;

use crate::worker::WorkerId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataflowError {
    #[error("invalid job graph: {0}")]
    InvalidGraph(String),

    #[error("slot allocation timed out after {0:?}")]
    SlotAllocationTimeout(Duration),

    #[error("worker {worker} rejected deployment: {reason}")]
    DeployRejected { worker: WorkerId, reason: String },

    #[error("task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("restarts exhausted after {attempts} attempts, last cause: {cause}")]
    RestartsExhausted { attempts: u32, cause: String },

    #[error("job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("job was canceled")]
    JobCanceled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DataflowError>;
