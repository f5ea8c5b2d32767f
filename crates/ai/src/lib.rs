//! `plansight-ai`
//!
//! **Responsibility:** the recognition job domain, free of IO.
//!
//! - `job`: the Job record and its state machine.
//! - `retry`: backoff and retry eligibility.
//! - `scheduler`: eligibility and priority + FIFO ordering.
//! - `result` / `ingest`: the canonical result model and the normalization
//!   layer that maps worker response shapes onto it.
//!
//! Storage, transport and the worker itself live in `plansight-infra`.

pub mod ingest;
pub mod job;
pub mod model;
pub mod result;
pub mod retry;
pub mod scheduler;

pub use ingest::{IngestError, normalize_response};
pub use job::{
    ErrorRecord, FailureCause, Job, JobId, JobStatus, JobTransitionError, LogEntry, LogLevel,
    NewJob, RetentionPolicy,
};
pub use model::{ModelType, Priority};
pub use result::{
    BoundingBox, ComplianceFinding, Detection, Dimension, FindingSeverity, LayerAnalysis,
    RecognitionResult, ResultStatistics, ResultSummary,
};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use scheduler::{TenantScope, scheduling_order, select_eligible};
