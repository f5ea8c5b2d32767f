//! Job API: the operations external callers use to manage recognition jobs.
//!
//! Validation happens here; lifecycle transitions are delegated to the
//! `Job` state machine and execution to the coordinator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use plansight_ai::{Job, JobId, JobStatus, LogLevel, NewJob, Priority, RetentionPolicy, TenantScope};
use plansight_core::TenantId;

use super::coordinator::{ExecuteOptions, ExecuteOutcome, ExecutionCoordinator};
use super::store::{JobFilter, JobPage, JobStore, Pagination};
use crate::error::JobError;
use crate::reporting::{JobReport, JobStatistics};
use crate::subject::SubjectRepository;

/// Editable fields of a job. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl JobUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.scheduled_for.is_none()
            && self.max_attempts.is_none()
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    subjects: Arc<dyn SubjectRepository>,
    coordinator: Arc<ExecutionCoordinator>,
    retention: RetentionPolicy,
}

impl JobService {
    pub fn new(
        coordinator: Arc<ExecutionCoordinator>,
        subjects: Arc<dyn SubjectRepository>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            store: Arc::clone(coordinator.store()),
            subjects,
            coordinator,
            retention,
        }
    }

    /// Submit a job in `Pending` and wake the dispatcher.
    #[instrument(skip(self, new), fields(tenant_id = %tenant_id, model_type = %new.model_type), err)]
    pub async fn create(&self, tenant_id: TenantId, new: NewJob) -> Result<Job, JobError> {
        let mut job = self.prepare(tenant_id, new).await?;
        self.store.insert(&mut job).await?;

        info!(job_id = %job.id, priority = job.priority.value(), "job submitted");
        self.coordinator.wakeup().notify_one();
        Ok(job)
    }

    /// Submit several jobs. Nothing is stored unless every entry is valid.
    #[instrument(skip(self, batch), fields(tenant_id = %tenant_id, size = batch.len()), err)]
    pub async fn create_batch(
        &self,
        tenant_id: TenantId,
        batch: Vec<NewJob>,
    ) -> Result<Vec<Job>, JobError> {
        if batch.is_empty() {
            return Err(JobError::Validation("batch contains no jobs".to_string()));
        }

        let mut jobs = Vec::with_capacity(batch.len());
        for (index, new) in batch.into_iter().enumerate() {
            let job = self.prepare(tenant_id, new).await.map_err(|e| match e {
                JobError::Validation(msg) => JobError::Validation(format!("job #{index}: {msg}")),
                JobError::NotFound(msg) => JobError::NotFound(format!("job #{index}: {msg}")),
                other => other,
            })?;
            jobs.push(job);
        }

        self.store.insert_batch(&mut jobs).await?;
        info!(count = jobs.len(), "job batch submitted");
        self.coordinator.wakeup().notify_one();
        Ok(jobs)
    }

    /// Fetch one job; the processing log is cut to the newest entries.
    pub async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobError> {
        let mut job = self.load(tenant_id, job_id).await?;
        let keep = job.recent_log(self.retention.read_log_limit).len();
        let skip = job.processing_log.len() - keep;
        job.processing_log.drain(..skip);
        Ok(job)
    }

    pub async fn search(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, JobError> {
        if let (Some(after), Some(before)) = (filter.created_after, filter.created_before) {
            if after > before {
                return Err(JobError::Validation(
                    "created_after must not be later than created_before".to_string(),
                ));
            }
        }
        Ok(self.store.search(tenant_id, filter, page).await?)
    }

    /// Edit a job that has not started running and has not finished.
    #[instrument(skip(self, update), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn update(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        update: JobUpdate,
    ) -> Result<Job, JobError> {
        let mut job = self.load(tenant_id, job_id).await?;

        if job.status == JobStatus::Processing || job.is_terminal() {
            return Err(JobError::Conflict(format!(
                "job {job_id} cannot be updated in status {}",
                job.status
            )));
        }
        if update.is_empty() {
            return Ok(job);
        }

        if let Some(name) = update.name {
            job.name = validate_name(&name)?;
        }
        if let Some(description) = update.description {
            job.description = Some(description);
        }
        if let Some(priority) = update.priority {
            job.priority = priority;
        }
        if let Some(at) = update.scheduled_for {
            job.scheduled_for = Some(at);
        }
        if let Some(max_attempts) = update.max_attempts {
            // A failed job must keep at least one attempt in hand: only the
            // retry path may make it terminal.
            let floor = if job.status == JobStatus::Failed {
                job.attempt_count + 1
            } else {
                job.attempt_count.max(1)
            };
            if max_attempts < floor {
                return Err(JobError::Validation(format!(
                    "max_attempts must be at least {floor}, got {max_attempts}"
                )));
            }
            job.max_attempts = max_attempts;
        }

        job.log(LogLevel::Info, "job details updated", Utc::now());
        self.store.save(&mut job).await?;
        Ok(job)
    }

    pub async fn execute(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        options: ExecuteOptions,
    ) -> Result<ExecuteOutcome, JobError> {
        self.coordinator.execute(tenant_id, job_id, options).await
    }

    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reason: Option<&str>,
    ) -> Result<Job, JobError> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("cancelled by user");
        self.coordinator.cancel(tenant_id, job_id, reason).await
    }

    /// Jobs of this tenant the dispatcher would pick next, in order.
    pub async fn queue(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<Job>, JobError> {
        Ok(self
            .store
            .eligible(TenantScope::Tenant(tenant_id), Utc::now(), limit, &[])
            .await?)
    }

    /// Aggregates over jobs created in `range` (all jobs when `None`).
    pub async fn statistics(
        &self,
        tenant_id: TenantId,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<JobStatistics, JobError> {
        let jobs = self.jobs_in_range(tenant_id, range).await?;
        Ok(JobStatistics::from_jobs(&jobs))
    }

    pub async fn report(
        &self,
        tenant_id: TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<JobReport, JobError> {
        let jobs = self.jobs_in_range(tenant_id, Some((from, to))).await?;
        Ok(JobReport::generate(tenant_id, from, to, &jobs, Utc::now()))
    }

    async fn prepare(&self, tenant_id: TenantId, mut new: NewJob) -> Result<Job, JobError> {
        new.name = validate_name(&new.name)?;
        if new.max_attempts == Some(0) {
            return Err(JobError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let subject = self.subjects.get_by_id(tenant_id, new.subject_id).await?;
        new.model_type.check_compatible(&subject.mime_type)?;

        Ok(Job::new(
            tenant_id,
            new,
            self.coordinator.retry_policy().default_max_attempts,
        ))
    }

    async fn load(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobError> {
        self.store
            .get(tenant_id, job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("job {job_id}")))
    }

    async fn jobs_in_range(
        &self,
        tenant_id: TenantId,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<Job>, JobError> {
        let filter = match range {
            Some((from, to)) => JobFilter::default().created_between(from, to),
            None => JobFilter::default(),
        };
        let page = self.search(tenant_id, &filter, Pagination::unbounded()).await?;
        Ok(page.jobs)
    }
}

fn validate_name(name: &str) -> Result<String, JobError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(JobError::Validation("job name is required".to_string()));
    }
    Ok(name.to_string())
}
