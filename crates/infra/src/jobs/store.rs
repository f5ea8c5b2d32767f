//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plansight_ai::{
    Job, JobId, JobStatus, ModelType, Priority, RetentionPolicy, TenantScope, select_eligible,
};
use plansight_core::{ExpectedVersion, SubjectId, TenantId, UserId};

/// Job store abstraction.
///
/// Every write bumps `Job::version` and trims history to the store's
/// retention policy. Writes against a stale version fail with
/// `JobStoreError::Conflict` and leave the stored job untouched.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Sets `version` to 1.
    async fn insert(&self, job: &mut Job) -> Result<(), JobStoreError>;

    /// Persist a batch of new jobs atomically: either all are stored or none.
    async fn insert_batch(&self, jobs: &mut [Job]) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Update a job if the stored version matches `expected`.
    async fn save_versioned(
        &self,
        job: &mut Job,
        expected: ExpectedVersion,
    ) -> Result<(), JobStoreError>;

    /// Update a job loaded at `job.version`.
    async fn save(&self, job: &mut Job) -> Result<(), JobStoreError> {
        let expected = ExpectedVersion::Exact(job.version);
        self.save_versioned(job, expected).await
    }

    /// Jobs the scheduler may start at `now`, in scheduling order.
    ///
    /// Jobs of tenants listed in `excluding` are left out.
    async fn eligible(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
        limit: usize,
        excluding: &[TenantId],
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Filtered, paginated listing, newest first.
    async fn search(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, JobStoreError>;

    /// Every job currently in `status` within `scope`.
    async fn list_in_status(
        &self,
        scope: TenantScope,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation for job {0}")]
    TenantIsolation(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} was modified concurrently (expected version {expected:?}, found {actual})")]
    Conflict {
        job_id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Search criteria. Every `None`/empty field matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub model_type: Option<ModelType>,
    pub priority: Option<Priority>,
    pub subject_id: Option<SubjectId>,
    pub initiated_by: Option<UserId>,
    /// Case-insensitive substring of name or description.
    pub text: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub can_execute: Option<bool>,
    pub can_retry: Option<bool>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_after = Some(from);
        self.created_before = Some(to);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if self.model_type.is_some_and(|m| m != job.model_type)
            || self.priority.is_some_and(|p| p != job.priority)
            || self.subject_id.is_some_and(|s| s != job.subject_id)
            || self.initiated_by.is_some_and(|u| Some(u) != job.initiated_by)
        {
            return false;
        }
        if self.created_after.is_some_and(|at| job.created_at < at)
            || self.created_before.is_some_and(|at| job.created_at > at)
        {
            return false;
        }
        if self.can_execute.is_some_and(|v| v != job.can_execute())
            || self.can_retry.is_some_and(|v| v != job.can_retry())
        {
            return false;
        }
        if let Some(text) = self.text.as_deref().map(str::to_lowercase) {
            let in_name = job.name.to_lowercase().contains(&text);
            let in_description = job
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&text));
            if !in_name && !in_description {
                return false;
            }
        }
        true
    }
}

/// Pagination parameters for job queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    /// No limit; for aggregate reads such as reports.
    pub fn unbounded() -> Self {
        Self {
            limit: u32::MAX,
            offset: 0,
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Matches across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn total(&self) -> usize {
        self.pending + self.queued + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    retention: RetentionPolicy,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::default())
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &mut Job) -> Result<(), JobStoreError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        job.version = 1;
        job.apply_retention(&self.retention);
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn insert_batch(&self, batch: &mut [Job]) -> Result<(), JobStoreError> {
        let mut jobs = self.write();
        if let Some(dup) = batch.iter().find(|j| jobs.contains_key(&j.id)) {
            return Err(JobStoreError::AlreadyExists(dup.id));
        }
        for job in batch.iter_mut() {
            job.version = 1;
            job.apply_retention(&self.retention);
            jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.read();
        match jobs.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation(job_id)),
            None => Ok(None),
        }
    }

    async fn save_versioned(
        &self,
        job: &mut Job,
        expected: ExpectedVersion,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.write();
        let stored = jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if stored.tenant_id != job.tenant_id {
            return Err(JobStoreError::TenantIsolation(job.id));
        }
        if !expected.matches(stored.version) {
            return Err(JobStoreError::Conflict {
                job_id: job.id,
                expected,
                actual: stored.version,
            });
        }

        job.version = stored.version + 1;
        job.apply_retention(&self.retention);
        *stored = job.clone();
        Ok(())
    }

    async fn eligible(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
        limit: usize,
        excluding: &[TenantId],
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read();
        let candidates = jobs.values().filter(|j| !excluding.contains(&j.tenant_id));
        Ok(select_eligible(candidates, scope, now, limit)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn search(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, JobStoreError> {
        let jobs = self.read();
        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let jobs: Vec<Job> = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        let has_more = total > u64::from(page.offset) + jobs.len() as u64;

        Ok(JobPage {
            jobs,
            total,
            pagination: page,
            has_more,
        })
    }

    async fn list_in_status(
        &self,
        scope: TenantScope,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read();
        Ok(jobs
            .values()
            .filter(|j| j.status == status && scope.allows(j.tenant_id))
            .cloned()
            .collect())
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.read();
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plansight_ai::{LogLevel, NewJob};
    use uuid::Uuid;

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn job_for(tenant: TenantId, name: &str) -> Job {
        Job::new(
            tenant,
            NewJob::new(name, SubjectId::new(), ModelType::SymbolDetection),
            3,
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let mut job = job_for(tenant, "ground floor");

        store.insert(&mut job).await.unwrap();
        assert_eq!(job.version, 1);

        let loaded = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let mut job = job_for(test_tenant(), "a");
        store.insert(&mut job).await.unwrap();

        let err = store.insert(&mut job).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(id) if id == job.id));
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let store = InMemoryJobStore::new();
        let tenant1 = test_tenant();
        let tenant2 = test_tenant();
        let mut job = job_for(tenant1, "a");
        store.insert(&mut job).await.unwrap();

        assert!(store.get(tenant1, job.id).await.unwrap().is_some());
        assert!(matches!(
            store.get(tenant2, job.id).await,
            Err(JobStoreError::TenantIsolation(_))
        ));
    }

    #[tokio::test]
    async fn stale_save_is_a_conflict() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let mut job = job_for(tenant, "a");
        store.insert(&mut job).await.unwrap();

        let mut first = store.get(tenant, job.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.mark_queued(Utc::now());
        store.save(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        second.cancel("stale writer", Utc::now()).unwrap();
        let err = store.save(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::Conflict { expected: ExpectedVersion::Exact(1), actual: 2, .. }
        ));

        let stored = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn save_any_skips_version_check() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let mut job = job_for(tenant, "a");
        store.insert(&mut job).await.unwrap();

        let mut stale = job.clone();
        store.save(&mut job).await.unwrap();
        store.save_versioned(&mut stale, ExpectedVersion::Any).await.unwrap();
        assert_eq!(stale.version, 3);
    }

    #[tokio::test]
    async fn writes_apply_retention() {
        let store = InMemoryJobStore::with_retention(RetentionPolicy {
            max_log_entries: 5,
            ..Default::default()
        });
        let tenant = test_tenant();
        let mut job = job_for(tenant, "chatty");
        for i in 0..20 {
            job.log(LogLevel::Debug, format!("line {i}"), Utc::now());
        }
        store.insert(&mut job).await.unwrap();

        let stored = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(stored.processing_log.len(), 5);
        assert_eq!(stored.processing_log.last().unwrap().message, "line 19");
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let mut existing = job_for(tenant, "existing");
        store.insert(&mut existing).await.unwrap();

        let mut batch = vec![job_for(tenant, "new"), existing.clone()];
        assert!(store.insert_batch(&mut batch).await.is_err());
        assert_eq!(store.stats(tenant).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn eligible_excludes_processing_and_respects_scope() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let other = test_tenant();

        let mut waiting = job_for(tenant, "waiting");
        let mut running = job_for(tenant, "running");
        running.start("w", Uuid::new_v4(), Utc::now()).unwrap();
        let mut foreign = job_for(other, "foreign");
        store.insert(&mut waiting).await.unwrap();
        store.insert(&mut running).await.unwrap();
        store.insert(&mut foreign).await.unwrap();

        let now = Utc::now();
        let mine = store.eligible(TenantScope::Tenant(tenant), now, 10, &[]).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, waiting.id);

        let all = store.eligible(TenantScope::Any, now, 10, &[]).await.unwrap();
        assert_eq!(all.len(), 2);

        let others = store.eligible(TenantScope::Any, now, 10, &[tenant]).await.unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, foreign.id);
    }

    #[tokio::test]
    async fn search_filters_and_paginates() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        for i in 0..5 {
            let mut job = job_for(tenant, &format!("Level {i} plan"));
            store.insert(&mut job).await.unwrap();
        }
        let mut cancelled = job_for(tenant, "Roof");
        cancelled.cancel("duplicate", Utc::now()).unwrap();
        store.insert(&mut cancelled).await.unwrap();

        let filter = JobFilter {
            text: Some("level".into()),
            ..Default::default()
        };
        let page = store
            .search(tenant, &filter, Pagination::new(Some(2), Some(0)))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);
        assert!(page.has_more);

        let executable = JobFilter {
            can_execute: Some(false),
            ..Default::default()
        };
        let page = store.search(tenant, &executable, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs[0].id, cancelled.id);

        let by_status = JobFilter::default().with_status(JobStatus::Pending);
        let page = store.search(tenant, &by_status, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 5);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let store = InMemoryJobStore::new();
        let tenant = test_tenant();
        let mut a = job_for(tenant, "a");
        let mut b = job_for(tenant, "b");
        b.start("w", Uuid::new_v4(), Utc::now()).unwrap();
        store.insert(&mut a).await.unwrap();
        store.insert(&mut b).await.unwrap();

        let stats = store.stats(tenant).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total(), 2);

        let processing = store
            .list_in_status(TenantScope::Any, JobStatus::Processing)
            .await
            .unwrap();
        assert_eq!(processing.len(), 1);
    }
}
