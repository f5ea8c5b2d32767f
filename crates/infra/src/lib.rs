//! `plansight-infra`
//!
//! **Responsibility:** everything around the job domain that touches the
//! outside world or runs concurrently.
//!
//! - `jobs`: storage (in-memory and Postgres), the concurrency gate, the
//!   execution coordinator, the dispatcher loop and the `JobService` API.
//! - `worker`: HTTP client for the recognition worker fleet.
//! - `subject`: access to the drawings jobs run against.
//! - `reporting`: statistics and reports over stored jobs.
//! - `config`: TOML + environment configuration.

pub mod config;
pub mod error;
pub mod jobs;
pub mod reporting;
pub mod subject;
pub mod worker;

pub use config::{AppConfig, ConfigError, LoggingConfig};
pub use error::JobError;
pub use reporting::{ErrorFrequency, JobReport, JobReportRow, JobStatistics};
pub use subject::{InMemorySubjectRepository, Subject, SubjectError, SubjectRepository};
pub use worker::{HttpRecognitionWorker, RecognitionRequest, RecognitionWorker, WorkerError};
