//! Subjects: the drawings and documents jobs are run against.
//!
//! Job execution reads the subject to find the file to send to the worker,
//! and writes a result summary back onto it after completion.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use plansight_ai::ResultSummary;
use plansight_core::{SubjectId, TenantId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Storage reference handed to the worker.
    pub file_ref: String,
    pub mime_type: String,
    /// Summary of the latest completed recognition job, if any.
    pub ai_summary: Option<ResultSummary>,
}

impl Subject {
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        file_ref: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id: SubjectId::new(),
            tenant_id,
            name: name.into(),
            file_ref: file_ref.into(),
            mime_type: mime_type.into(),
            ai_summary: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubjectError {
    #[error("subject not found: {0}")]
    NotFound(SubjectId),
    #[error("subject store unavailable: {0}")]
    Unavailable(String),
}

/// Read/write access to subjects, always tenant-scoped.
#[async_trait]
pub trait SubjectRepository: Send + Sync {
    async fn get_by_id(&self, tenant_id: TenantId, id: SubjectId) -> Result<Subject, SubjectError>;

    /// Attach the summary of a completed job to the subject.
    async fn apply_ai_result(
        &self,
        tenant_id: TenantId,
        id: SubjectId,
        summary: &ResultSummary,
    ) -> Result<(), SubjectError>;
}

/// In-memory subject repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySubjectRepository {
    subjects: RwLock<HashMap<SubjectId, Subject>>,
}

impl InMemorySubjectRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject: Subject) {
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.id, subject);
    }
}

#[async_trait]
impl SubjectRepository for InMemorySubjectRepository {
    async fn get_by_id(&self, tenant_id: TenantId, id: SubjectId) -> Result<Subject, SubjectError> {
        self.subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .ok_or(SubjectError::NotFound(id))
    }

    async fn apply_ai_result(
        &self,
        tenant_id: TenantId,
        id: SubjectId,
        summary: &ResultSummary,
    ) -> Result<(), SubjectError> {
        let mut subjects = self.subjects.write().unwrap_or_else(PoisonError::into_inner);
        let subject = subjects
            .get_mut(&id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or(SubjectError::NotFound(id))?;
        subject.ai_summary = Some(summary.clone());
        Ok(())
    }
}
