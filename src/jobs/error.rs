use thiserror::Error;

use super::model::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} is already linked to server job {existing}")]
    AlreadyLinked { id: String, existing: String },

    #[error("Cannot update progress of job {id} in status {status}")]
    InvalidProgress { id: String, status: JobStatus },
}

pub type Result<T> = std::result::Result<T, JobError>;
