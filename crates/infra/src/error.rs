//! Error surface of the job lifecycle API.

use chrono::{DateTime, Utc};
use thiserror::Error;

use plansight_ai::{JobId, JobTransitionError};
use plansight_core::DomainError;

use crate::jobs::store::JobStoreError;
use crate::subject::SubjectError;

/// Errors returned by `JobService` and the execution coordinator.
///
/// Execution failures of a job are recorded on the job itself; the
/// `*Execution` variants only surface them to a caller that waits on an
/// attempt.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("job {job_id} attempt {attempt} failed, retry at {next_retry_at}: {message}")]
    TransientExecution {
        job_id: JobId,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        message: String,
    },

    #[error("job {job_id} failed permanently after {attempts} attempts: {message}")]
    TerminalExecution {
        job_id: JobId,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    Store(JobStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(format!("job {id}")),
            // Cross-tenant lookups are indistinguishable from missing jobs.
            JobStoreError::TenantIsolation(id) => JobError::NotFound(format!("job {id}")),
            JobStoreError::Conflict { .. } | JobStoreError::AlreadyExists(_) => {
                JobError::Conflict(err.to_string())
            }
            other => JobError::Store(other),
        }
    }
}

impl From<JobTransitionError> for JobError {
    fn from(err: JobTransitionError) -> Self {
        JobError::Conflict(err.to_string())
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::Validation(msg),
        }
    }
}

impl From<SubjectError> for JobError {
    fn from(err: SubjectError) -> Self {
        match err {
            SubjectError::NotFound(_) => JobError::NotFound(err.to_string()),
            SubjectError::Unavailable(msg) => JobError::Internal(msg),
        }
    }
}

impl JobError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Conflict(_) | JobError::TransientExecution { .. })
            || matches!(self, JobError::Store(JobStoreError::Storage(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plansight_ai::JobStatus;

    #[test]
    fn tenant_isolation_reads_as_not_found() {
        let id = JobId::new();
        let err: JobError = JobStoreError::TenantIsolation(id).into();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[test]
    fn transition_errors_are_conflicts() {
        let err: JobError = JobTransitionError::AlreadyTerminal(JobStatus::Completed).into();
        assert!(matches!(err, JobError::Conflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn domain_validation_maps_to_validation() {
        let err: JobError = DomainError::validation("bad mime").into();
        assert!(matches!(err, JobError::Validation(ref m) if m == "bad mime"));
    }
}
