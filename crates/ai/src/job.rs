//! The recognition job record and its state machine.
//!
//! ```text
//! Pending ──► Queued ──► Processing ──► Completed
//!    │           │          │  ▲
//!    │           │          ▼  │ (attempts remain, next_retry_at passed)
//!    │           │        Failed ──► terminal Failed (attempts exhausted)
//!    └───────────┴──────────┴──────► Cancelled
//! ```
//!
//! Transitions are methods on `Job`; they validate the source state and
//! never perform IO. Persisting the mutated record is the caller's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use plansight_core::{SubjectId, TenantId, UserId};

use crate::model::{ModelType, Priority};
use crate::result::RecognitionResult;
use crate::retry::{RetryDecision, RetryPolicy};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for its schedule or first pick-up
    Pending,
    /// Eligible but held back by the concurrency gate
    Queued,
    /// An attempt is in flight
    Processing,
    /// Finished with a result
    Completed,
    /// Last attempt failed; retry-eligible while attempts remain
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt failed.
///
/// Timeouts are kept distinct from other transient failures for diagnosis;
/// they share the same retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    WorkerStatus { status: u16 },
    Network,
    InvalidResponse,
    SubjectUnavailable,
    /// The process running the attempt went away mid-flight.
    Interrupted,
    Internal,
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub attempt_number: u32,
    pub message: String,
    pub detail: Option<String>,
    pub cause: FailureCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Processing log line attached to the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// How much append-only history a job keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Oldest log entries beyond this are dropped at write time.
    pub max_log_entries: usize,
    /// Oldest error records beyond this are dropped at write time.
    pub max_error_records: usize,
    /// Default number of log entries returned by reads.
    pub read_log_limit: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_log_entries: 500,
            max_error_records: 100,
            read_log_limit: 50,
        }
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobTransitionError {
    #[error("cannot {action} job in status {status}")]
    InvalidState { action: &'static str, status: JobStatus },

    #[error("job already finished with status {0}")]
    AlreadyTerminal(JobStatus),

    #[error("attempt budget exhausted ({attempts}/{max_attempts})")]
    AttemptsExhausted { attempts: u32, max_attempts: u32 },
}

/// Submission payload for a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub subject_id: SubjectId,
    pub model_type: ModelType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub model_config: JsonValue,
    #[serde(default)]
    pub processing_params: JsonValue,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub initiated_by: Option<UserId>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, subject_id: SubjectId, model_type: ModelType) -> Self {
        Self {
            name: name.into(),
            description: None,
            subject_id,
            model_type,
            priority: Priority::default(),
            model_config: JsonValue::Null,
            processing_params: JsonValue::Null,
            scheduled_for: None,
            max_attempts: None,
            initiated_by: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A tenant-scoped request to run one recognition model over one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub subject_id: SubjectId,
    pub initiated_by: Option<UserId>,

    pub model_type: ModelType,
    pub model_config: JsonValue,
    pub processing_params: JsonValue,
    pub priority: Priority,

    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    pub current_stage: Option<String>,

    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_seconds: Option<i64>,

    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_history: Vec<ErrorRecord>,

    pub worker_id: Option<String>,
    pub session_id: Option<Uuid>,

    pub results: Option<RecognitionResult>,
    pub processing_log: Vec<LogEntry>,
    pub cancellation_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped by the store on every save.
    pub version: u64,
}

impl Job {
    /// Create a new job in `Pending`.
    pub fn new(tenant_id: TenantId, new: NewJob, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        let mut job = Self {
            id: JobId::new(),
            tenant_id,
            name: new.name,
            description: new.description,
            subject_id: new.subject_id,
            initiated_by: new.initiated_by,
            model_type: new.model_type,
            model_config: new.model_config,
            processing_params: new.processing_params,
            priority: new.priority,
            status: JobStatus::Pending,
            progress: 0,
            current_stage: None,
            scheduled_for: new.scheduled_for,
            started_at: None,
            completed_at: None,
            processing_time_seconds: None,
            attempt_count: 0,
            max_attempts: new.max_attempts.unwrap_or(default_max_attempts).max(1),
            next_retry_at: None,
            error_history: Vec::new(),
            worker_id: None,
            session_id: None,
            results: None,
            processing_log: Vec::new(),
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let message = format!("job created for model {}", job.model_type);
        job.log(LogLevel::Info, message, now);
        job
    }

    /// Completed, Cancelled, or Failed with no attempts left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Failed => self.attempt_count >= self.max_attempts,
            _ => false,
        }
    }

    /// Failed with attempts remaining (regardless of backoff).
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempt_count < self.max_attempts
    }

    /// Whether a non-forced `execute` may start this job now.
    pub fn can_execute(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Queued) || self.can_retry()
    }

    /// Whether a forced `execute` may start this job.
    pub fn can_force_execute(&self) -> bool {
        self.can_execute() || (self.status == JobStatus::Failed && self.is_terminal())
    }

    /// Candidate for the scheduler right now.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending | JobStatus::Queued => {
                self.scheduled_for.is_none_or(|at| at <= now)
            }
            JobStatus::Failed => {
                self.attempt_count < self.max_attempts
                    && self.next_retry_at.is_none_or(|at| at <= now)
            }
            _ => false,
        }
    }

    /// The newest `limit` processing log entries, oldest first.
    pub fn recent_log(&self, limit: usize) -> &[LogEntry] {
        let start = self.processing_log.len().saturating_sub(limit);
        &self.processing_log[start..]
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, now: DateTime<Utc>) {
        self.processing_log.push(LogEntry {
            timestamp: now,
            level,
            message: message.into(),
        });
        self.updated_at = now;
    }

    /// Drop the oldest history beyond the retention caps.
    pub fn apply_retention(&mut self, policy: &RetentionPolicy) {
        trim_front(&mut self.processing_log, policy.max_log_entries);
        trim_front(&mut self.error_history, policy.max_error_records);
    }

    /// Pending → Queued when the concurrency gate defers the job.
    ///
    /// Queued and retry-eligible Failed jobs are left as they are.
    pub fn mark_queued(&mut self, now: DateTime<Utc>) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Queued;
            self.log(LogLevel::Info, "queued: tenant concurrency limit reached", now);
        }
    }

    /// Begin a fresh attempt cycle for a terminally failed job (forced re-run).
    pub fn reset_attempts(&mut self, now: DateTime<Utc>) {
        let previous = self.attempt_count;
        self.attempt_count = 0;
        self.next_retry_at = None;
        self.completed_at = None;
        self.log(
            LogLevel::Warn,
            format!("attempt budget reset by forced execution (was {previous}/{})", self.max_attempts),
            now,
        );
    }

    /// Pending/Queued/retry-eligible Failed → Processing.
    pub fn start(
        &mut self,
        worker_id: impl Into<String>,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        if !matches!(
            self.status,
            JobStatus::Pending | JobStatus::Queued | JobStatus::Failed
        ) {
            return Err(if self.is_terminal() {
                JobTransitionError::AlreadyTerminal(self.status)
            } else {
                JobTransitionError::InvalidState {
                    action: "start",
                    status: self.status,
                }
            });
        }
        if self.attempt_count >= self.max_attempts {
            return Err(JobTransitionError::AttemptsExhausted {
                attempts: self.attempt_count,
                max_attempts: self.max_attempts,
            });
        }

        let worker_id = worker_id.into();
        self.attempt_count += 1;
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.completed_at = None;
        self.processing_time_seconds = None;
        self.next_retry_at = None;
        self.progress = 0;
        self.current_stage = Some("started".to_string());
        self.session_id = Some(session_id);
        self.log(
            LogLevel::Info,
            format!(
                "attempt {}/{} started on worker {worker_id} (session {session_id})",
                self.attempt_count, self.max_attempts
            ),
            now,
        );
        self.worker_id = Some(worker_id);
        Ok(())
    }

    /// Progress tick while Processing. Progress never moves backwards.
    pub fn record_progress(
        &mut self,
        progress: u8,
        stage: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        self.require(JobStatus::Processing, "update progress of")?;

        let stage = stage.into();
        self.progress = self.progress.max(progress.min(100));
        self.log(
            LogLevel::Debug,
            format!("progress {}% ({stage})", self.progress),
            now,
        );
        self.current_stage = Some(stage);
        Ok(())
    }

    /// Processing → Completed.
    pub fn complete(
        &mut self,
        results: RecognitionResult,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        self.require(JobStatus::Processing, "complete")?;

        let started = self.started_at.unwrap_or(now);
        let elapsed_ms = (now - started).num_milliseconds().max(0);

        self.status = JobStatus::Completed;
        self.progress = 100;
        self.current_stage = Some("completed".to_string());
        self.completed_at = Some(now);
        self.processing_time_seconds = Some((elapsed_ms as f64 / 1000.0).round() as i64);
        self.next_retry_at = None;
        self.log(
            LogLevel::Info,
            format!(
                "completed with {} detections in {}s",
                results.statistics.count,
                self.processing_time_seconds.unwrap_or_default()
            ),
            now,
        );
        self.results = Some(results);
        Ok(())
    }

    /// Processing → Failed, consulting the retry policy.
    ///
    /// Records the failure against the current attempt. When attempts remain
    /// the job becomes retry-eligible at `next_retry_at`; otherwise it is
    /// terminally failed and `completed_at` is stamped.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        detail: Option<String>,
        cause: FailureCause,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, JobTransitionError> {
        self.require(JobStatus::Processing, "fail")?;

        let message = message.into();
        self.error_history.push(ErrorRecord {
            timestamp: now,
            attempt_number: self.attempt_count,
            message: message.clone(),
            detail,
            cause,
        });
        self.status = JobStatus::Failed;
        self.current_stage = Some("failed".to_string());

        let decision = policy.decide(self.attempt_count, self.max_attempts, now);
        match decision {
            RetryDecision::RetryAt { at, delay } => {
                self.next_retry_at = Some(at);
                self.log(
                    LogLevel::Warn,
                    format!(
                        "attempt {} failed: {message}; retry in {}s",
                        self.attempt_count,
                        delay.as_secs()
                    ),
                    now,
                );
            }
            RetryDecision::Exhausted => {
                self.next_retry_at = None;
                self.completed_at = Some(now);
                self.log(
                    LogLevel::Error,
                    format!(
                        "attempt {} failed: {message}; no attempts remaining",
                        self.attempt_count
                    ),
                    now,
                );
            }
        }
        Ok(decision)
    }

    /// Any non-terminal state → Cancelled. Rejected on terminal jobs.
    pub fn cancel(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        if self.is_terminal() {
            return Err(JobTransitionError::AlreadyTerminal(self.status));
        }

        let reason = reason.into();
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.next_retry_at = None;
        self.current_stage = Some("cancelled".to_string());
        self.log(LogLevel::Warn, format!("cancelled: {reason}"), now);
        self.cancellation_reason = Some(reason);
        Ok(())
    }

    fn require(&self, status: JobStatus, action: &'static str) -> Result<(), JobTransitionError> {
        if self.status == status {
            Ok(())
        } else {
            Err(JobTransitionError::InvalidState {
                action,
                status: self.status,
            })
        }
    }
}

fn trim_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}
