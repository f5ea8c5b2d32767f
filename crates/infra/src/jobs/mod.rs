//! Recognition job execution.
//!
//! ## Components
//!
//! - `JobStore`: versioned persistence (in-memory or Postgres)
//! - `ConcurrencyGate`: per-tenant cap on in-flight attempts
//! - `ExecutionCoordinator`: runs one attempt end to end
//! - `Dispatcher`: background loop that starts eligible jobs
//! - `JobService`: the operations exposed to callers

pub mod coordinator;
pub mod dispatcher;
pub mod gate;
pub mod postgres;
pub mod service;
pub mod store;

pub use coordinator::{
    ExecuteOptions, ExecuteOutcome, ExecutionCoordinator, ExecutionHandle, ExecutionSettings,
};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, PassSummary};
pub use gate::{ConcurrencyGate, GatePermit};
pub use postgres::PostgresJobStore;
pub use service::{JobService, JobUpdate};
pub use store::{InMemoryJobStore, JobFilter, JobPage, JobStats, JobStore, JobStoreError, Pagination};
