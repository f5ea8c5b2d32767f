//! `plansight-core`: shared building blocks.
//!
//! Identifiers, the domain error model and optimistic concurrency
//! expectations. No infrastructure concerns live here.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{SubjectId, TenantId, UserId};
pub use version::ExpectedVersion;
