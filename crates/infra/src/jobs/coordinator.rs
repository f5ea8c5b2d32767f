//! Execution coordinator: runs one attempt of a job end to end.
//!
//! ## Attempt flow
//!
//! 1. Eligibility check (`can_execute`, or `can_force_execute` when forced)
//! 2. Concurrency gate: a denied job is marked `Queued` and left for the
//!    dispatcher; a forced job takes a slot regardless of the limit
//! 3. `Job::start` + persist (the attempt is counted here)
//! 4. Spawned task: subject lookup, worker call under a timeout,
//!    normalization, completion, summary write-back to the subject
//! 5. Any failure is recorded through `Job::fail` and the retry policy
//!
//! Every write after step 3 is made against the version the attempt last
//! saw. If the job changed underneath (cancelled, or failed by stale-run
//! recovery) the attempt stops and its outcome is discarded.
//!
//! ## Cancellation
//!
//! Each running attempt holds a `CancellationToken`. `cancel` persists the
//! `Cancelled` status first and then trips the token, which drops the
//! in-flight worker call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use plansight_ai::{
    FailureCause, Job, JobId, JobStatus, JobTransitionError, LogLevel, ResultSummary, RetryDecision,
    RetryPolicy, TenantScope, normalize_response,
};
use plansight_core::TenantId;

use super::gate::{ConcurrencyGate, GatePermit};
use super::store::{JobStore, JobStoreError};
use crate::config::AppConfig;
use crate::error::JobError;
use crate::subject::SubjectRepository;
use crate::worker::{RecognitionRequest, RecognitionWorker, WorkerError};

/// Saves retried after a version conflict before giving up.
const SAVE_ATTEMPTS: usize = 3;

const PROGRESS_DISPATCHED: u8 = 10;
const PROGRESS_INGESTING: u8 = 90;

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Recorded on jobs started without an explicit worker id.
    pub worker_id: String,
    /// Attempt timeout when the caller does not give one.
    pub default_timeout: Duration,
}

impl ExecutionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            worker_id: config.execution.worker_id.clone(),
            default_timeout: config.worker.request_timeout(),
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            worker_id: "plansight-dispatcher".to_string(),
            default_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Bypass the concurrency gate and re-run terminally failed jobs.
    pub force: bool,
    pub worker_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub enum ExecuteOutcome {
    /// An attempt is running in the background.
    Started(ExecutionHandle),
    /// The tenant is at its concurrency limit; the job waits in `Queued`.
    Queued(Job),
}

impl ExecuteOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, ExecuteOutcome::Started(_))
    }
}

/// Handle to a running attempt.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub job_id: JobId,
    pub session_id: Uuid,
    join: JoinHandle<Job>,
}

impl ExecutionHandle {
    /// Wait for the attempt to end and return the job as it was left.
    pub async fn join(self) -> Result<Job, JobError> {
        self.join
            .await
            .map_err(|e| JobError::Internal(format!("attempt task for job {} failed: {e}", self.job_id)))
    }

    /// Like `join`, but a failed attempt is returned as an error.
    pub async fn wait(self) -> Result<Job, JobError> {
        let job = self.join().await?;
        if job.status != JobStatus::Failed {
            return Ok(job);
        }

        let message = job
            .error_history
            .last()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        if job.can_retry() {
            Err(JobError::TransientExecution {
                job_id: job.id,
                attempt: job.attempt_count,
                next_retry_at: job.next_retry_at.unwrap_or(job.updated_at),
                message,
            })
        } else {
            Err(JobError::TerminalExecution {
                job_id: job.id,
                attempts: job.attempt_count,
                message,
            })
        }
    }
}

/// Why an attempt stopped short of completion.
#[derive(Debug)]
enum AttemptError {
    Failed {
        message: String,
        detail: Option<String>,
        cause: FailureCause,
    },
    /// The job was changed by someone else; this attempt no longer owns it.
    Superseded,
    Store(JobStoreError),
}

impl From<WorkerError> for AttemptError {
    fn from(err: WorkerError) -> Self {
        AttemptError::Failed {
            message: err.to_string(),
            detail: err.detail(),
            cause: err.cause(),
        }
    }
}

pub struct ExecutionCoordinator {
    store: Arc<dyn JobStore>,
    worker: Arc<dyn RecognitionWorker>,
    subjects: Arc<dyn SubjectRepository>,
    gate: Arc<ConcurrencyGate>,
    retry: RetryPolicy,
    settings: ExecutionSettings,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker: Arc<dyn RecognitionWorker>,
        subjects: Arc<dyn SubjectRepository>,
        gate: Arc<ConcurrencyGate>,
        retry: RetryPolicy,
        settings: ExecutionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            worker,
            subjects,
            gate,
            retry,
            settings,
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Signalled when capacity frees up or new work arrives.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.gate.released()
    }

    /// Attempts currently running in this process.
    pub fn running_count(&self) -> usize {
        self.running_map().len()
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running_map().contains_key(&job_id)
    }

    /// Start an attempt of `job_id`, or queue it if the tenant is at capacity.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id, job_id = %job_id, force = options.force), err)]
    pub async fn execute(
        self: &Arc<Self>,
        tenant_id: TenantId,
        job_id: JobId,
        options: ExecuteOptions,
    ) -> Result<ExecuteOutcome, JobError> {
        let mut job = self
            .store
            .get(tenant_id, job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("job {job_id}")))?;

        let allowed = if options.force {
            job.can_force_execute()
        } else {
            job.can_execute()
        };
        if !allowed {
            return Err(JobError::Conflict(format!(
                "job {job_id} cannot be executed in status {} ({}/{} attempts used)",
                job.status, job.attempt_count, job.max_attempts
            )));
        }

        let now = Utc::now();
        let permit = if options.force {
            self.gate.acquire_override(tenant_id)
        } else {
            match self.gate.try_acquire(tenant_id) {
                Some(permit) => permit,
                None => {
                    if job.status == JobStatus::Pending {
                        job.mark_queued(now);
                        self.store.save(&mut job).await?;
                    }
                    info!(
                        job_id = %job_id,
                        tenant_id = %tenant_id,
                        in_flight = self.gate.in_flight(tenant_id),
                        "tenant at concurrency limit, job queued"
                    );
                    return Ok(ExecuteOutcome::Queued(job));
                }
            }
        };

        if options.force {
            warn!(
                job_id = %job_id,
                tenant_id = %tenant_id,
                gate_override = true,
                in_flight = self.gate.in_flight(tenant_id),
                limit = self.gate.limit(),
                "forced execution"
            );
            job.log(
                LogLevel::Warn,
                "forced execution: concurrency gate bypassed",
                now,
            );
            if job.is_terminal() {
                job.reset_attempts(now);
            }
        }

        let session_id = Uuid::new_v4();
        let worker_id = options
            .worker_id
            .unwrap_or_else(|| self.settings.worker_id.clone());
        job.start(worker_id, session_id, now)?;
        self.store.save(&mut job).await?;

        let token = CancellationToken::new();
        self.running_map().insert(job_id, token.clone());

        info!(
            job_id = %job_id,
            tenant_id = %tenant_id,
            attempt = job.attempt_count,
            max_attempts = job.max_attempts,
            session_id = %session_id,
            "attempt started"
        );

        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        let coordinator = Arc::clone(self);
        let join = tokio::spawn(async move {
            coordinator
                .run_attempt(job, session_id, permit, token, timeout)
                .await
        });

        Ok(ExecuteOutcome::Started(ExecutionHandle {
            job_id,
            session_id,
            join,
        }))
    }

    /// Cancel a non-terminal job and abort its running attempt, if any.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reason: &str,
    ) -> Result<Job, JobError> {
        for _ in 0..SAVE_ATTEMPTS {
            let mut job = self
                .store
                .get(tenant_id, job_id)
                .await?
                .ok_or_else(|| JobError::NotFound(format!("job {job_id}")))?;
            job.cancel(reason, Utc::now())?;

            match self.store.save(&mut job).await {
                Ok(()) => {
                    let aborted = self.abort(job_id);
                    info!(job_id = %job_id, aborted, "job cancelled");
                    return Ok(job);
                }
                Err(JobStoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(JobError::Conflict(format!(
            "job {job_id} kept changing while being cancelled"
        )))
    }

    /// Fail `Processing` jobs whose attempt is older than `stale_after` and
    /// is not running in this process. Returns how many were recovered.
    #[instrument(skip(self))]
    pub async fn recover_stale(&self, stale_after: Duration) -> Result<usize, JobError> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };

        let processing = self
            .store
            .list_in_status(TenantScope::Any, JobStatus::Processing)
            .await?;

        let mut recovered = 0;
        for mut job in processing {
            let started = job.started_at.unwrap_or(job.updated_at);
            if started > cutoff || self.is_running(job.id) {
                continue;
            }

            let message = format!(
                "attempt interrupted: no live execution {}s after start",
                stale_after.as_secs()
            );
            let decision = job.fail(message, None, FailureCause::Interrupted, &self.retry, now)?;
            match self.store.save(&mut job).await {
                Ok(()) => {
                    recovered += 1;
                    warn!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        attempt = job.attempt_count,
                        will_retry = decision.will_retry(),
                        "recovered stale attempt"
                    );
                }
                Err(JobStoreError::Conflict { .. }) => {
                    debug!(job_id = %job.id, "stale job changed during recovery, skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(recovered)
    }

    async fn run_attempt(
        self: Arc<Self>,
        mut job: Job,
        session_id: Uuid,
        _permit: GatePermit,
        token: CancellationToken,
        timeout: Duration,
    ) -> Job {
        let job_id = job.id;
        let _running = RunningEntry {
            running: &self.running,
            job_id,
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.perform(&mut job, session_id, timeout) => Some(result),
        };

        match outcome {
            Some(Ok(())) => {
                info!(
                    job_id = %job_id,
                    attempt = job.attempt_count,
                    processing_time_seconds = job.processing_time_seconds.unwrap_or_default(),
                    "attempt completed"
                );
            }
            Some(Err(AttemptError::Failed {
                message,
                detail,
                cause,
            })) => {
                self.record_failure(&mut job, session_id, message, detail, cause)
                    .await;
            }
            Some(Err(AttemptError::Superseded)) => {
                info!(job_id = %job_id, status = %job.status, "job changed during attempt, outcome discarded");
            }
            Some(Err(AttemptError::Store(e))) => {
                error!(job_id = %job_id, error = %e, "storage failure during attempt");
                self.record_failure(
                    &mut job,
                    session_id,
                    format!("storage failure during attempt: {e}"),
                    None,
                    FailureCause::Internal,
                )
                .await;
            }
            None => {
                info!(job_id = %job_id, "attempt aborted by cancellation");
                if let Ok(Some(current)) = self.store.get(job.tenant_id, job_id).await {
                    job = current;
                }
            }
        }

        job
    }

    async fn perform(
        &self,
        job: &mut Job,
        session_id: Uuid,
        timeout: Duration,
    ) -> Result<(), AttemptError> {
        let subject = self
            .subjects
            .get_by_id(job.tenant_id, job.subject_id)
            .await
            .map_err(|e| AttemptError::Failed {
                message: e.to_string(),
                detail: None,
                cause: FailureCause::SubjectUnavailable,
            })?;

        let request = RecognitionRequest {
            subject_ref: *subject.id.as_uuid(),
            file_ref: subject.file_ref,
            mime_type: subject.mime_type,
            model_config: job.model_config.clone(),
            processing_params: job.processing_params.clone(),
            job_id: job.id,
        };

        self.commit(job, session_id, |j| {
            j.record_progress(PROGRESS_DISPATCHED, "dispatched", Utc::now())
        })
        .await?;

        let call = self.worker.recognize(job.model_type, &request, timeout);
        let raw = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result?,
            Err(_) => return Err(WorkerError::Timeout(timeout).into()),
        };

        self.commit(job, session_id, |j| {
            j.record_progress(PROGRESS_INGESTING, "ingesting", Utc::now())
        })
        .await?;

        let result = normalize_response(&raw).map_err(|e| AttemptError::Failed {
            message: format!("unusable worker response: {e}"),
            detail: None,
            cause: FailureCause::InvalidResponse,
        })?;
        let summary = ResultSummary::from_result(job.id, job.model_type, &result, Utc::now());

        self.commit(job, session_id, |j| j.complete(result.clone(), Utc::now()))
            .await?;

        if let Err(e) = self
            .subjects
            .apply_ai_result(job.tenant_id, job.subject_id, &summary)
            .await
        {
            warn!(
                job_id = %job.id,
                subject_id = %job.subject_id,
                error = %e,
                "failed to write result summary to subject"
            );
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        job: &mut Job,
        session_id: Uuid,
        message: String,
        detail: Option<String>,
        cause: FailureCause,
    ) {
        let retry = &self.retry;
        let recorded = self
            .commit(job, session_id, |j| {
                j.fail(message.clone(), detail.clone(), cause.clone(), retry, Utc::now())
            })
            .await;

        match recorded {
            Ok(RetryDecision::RetryAt { at, delay }) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    max_attempts = job.max_attempts,
                    cause = ?cause,
                    error = %message,
                    next_retry_at = %at,
                    delay_secs = delay.as_secs(),
                    "attempt failed, retry scheduled"
                );
            }
            Ok(RetryDecision::Exhausted) => {
                error!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    cause = ?cause,
                    error = %message,
                    "attempt failed, no attempts remaining"
                );
            }
            Err(AttemptError::Store(e)) => {
                error!(
                    job_id = %job.id,
                    error = %e,
                    "could not record attempt failure; job left for stale-run recovery"
                );
            }
            Err(_) => {
                info!(job_id = %job.id, status = %job.status, "job changed during attempt, failure discarded");
            }
        }
    }

    /// Apply `mutate` and persist, as long as this attempt still owns the job.
    ///
    /// On a version conflict the job is reloaded; if it is still `Processing`
    /// under `session_id` the mutation is re-applied to the fresh copy.
    async fn commit<T, F>(
        &self,
        job: &mut Job,
        session_id: Uuid,
        mut mutate: F,
    ) -> Result<T, AttemptError>
    where
        F: FnMut(&mut Job) -> Result<T, JobTransitionError> + Send,
        T: Send,
    {
        let mut candidate = job.clone();
        for _ in 0..SAVE_ATTEMPTS {
            let value = mutate(&mut candidate).map_err(|_| AttemptError::Superseded)?;
            match self.store.save(&mut candidate).await {
                Ok(()) => {
                    *job = candidate;
                    return Ok(value);
                }
                Err(JobStoreError::Conflict { .. }) => {
                    let fresh = self
                        .store
                        .get(job.tenant_id, job.id)
                        .await
                        .map_err(AttemptError::Store)?
                        .ok_or(AttemptError::Superseded)?;
                    if fresh.status != JobStatus::Processing || fresh.session_id != Some(session_id) {
                        *job = fresh;
                        return Err(AttemptError::Superseded);
                    }
                    candidate = fresh;
                }
                Err(e) => return Err(AttemptError::Store(e)),
            }
        }
        Err(AttemptError::Superseded)
    }

    fn abort(&self, job_id: JobId) -> bool {
        match self.running_map().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn running_map(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the attempt from the running map however `run_attempt` exits,
/// unwinding included.
struct RunningEntry<'a> {
    running: &'a Mutex<HashMap<JobId, CancellationToken>>,
    job_id: JobId,
}

impl Drop for RunningEntry<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}
