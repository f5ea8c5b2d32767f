//! Postgres-backed job store.
//!
//! Jobs live in one `recognition_jobs` table: the full record as a JSONB
//! document plus the columns every query filters or orders on. The columns
//! are rewritten from the document on each save, so they never drift.
//!
//! ## Optimistic Concurrency
//!
//! `save` is a single `UPDATE ... WHERE version = $expected`. Zero affected
//! rows means the job is missing, belongs to another tenant, or was written
//! concurrently; a follow-up read tells which.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use plansight_ai::{Job, JobId, JobStatus, RetentionPolicy, TenantScope};
use plansight_core::{ExpectedVersion, TenantId};

use super::store::{JobFilter, JobPage, JobStats, JobStore, JobStoreError, Pagination};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS recognition_jobs (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    status          TEXT NOT NULL,
    priority        SMALLINT NOT NULL,
    model_type      TEXT NOT NULL,
    subject_id      UUID NOT NULL,
    initiated_by    UUID NULL,
    name            TEXT NOT NULL,
    description     TEXT NULL,
    attempt_count   INTEGER NOT NULL,
    max_attempts    INTEGER NOT NULL,
    scheduled_for   TIMESTAMPTZ NULL,
    next_retry_at   TIMESTAMPTZ NULL,
    started_at      TIMESTAMPTZ NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    version         BIGINT NOT NULL,
    document        JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS recognition_jobs_schedule_idx
    ON recognition_jobs (status, priority, created_at);
CREATE INDEX IF NOT EXISTS recognition_jobs_tenant_idx
    ON recognition_jobs (tenant_id, created_at DESC);
"#;

/// Matches `Job::is_eligible` at `$2`.
const ELIGIBLE_PREDICATE: &str = r#"
    (status IN ('pending', 'queued') AND (scheduled_for IS NULL OR scheduled_for <= $2))
    OR (status = 'failed' AND attempt_count < max_attempts
        AND (next_retry_at IS NULL OR next_retry_at <= $2))
"#;

/// Shared WHERE clause for `search`; parameters `$1`..`$11`.
const FILTER_PREDICATE: &str = r#"
    tenant_id = $1
    AND (cardinality($2::text[]) = 0 OR status = ANY($2))
    AND ($3::text IS NULL OR model_type = $3)
    AND ($4::smallint IS NULL OR priority = $4)
    AND ($5::uuid IS NULL OR subject_id = $5)
    AND ($6::uuid IS NULL OR initiated_by = $6)
    AND ($7::text IS NULL OR name ILIKE $7 OR description ILIKE $7)
    AND ($8::timestamptz IS NULL OR created_at >= $8)
    AND ($9::timestamptz IS NULL OR created_at <= $9)
    AND ($10::boolean IS NULL OR $10 = (
        status IN ('pending', 'queued') OR (status = 'failed' AND attempt_count < max_attempts)))
    AND ($11::boolean IS NULL OR $11 = (status = 'failed' AND attempt_count < max_attempts))
"#;

/// Postgres-backed job store.
///
/// Every query includes `tenant_id` in the WHERE clause except the
/// dispatcher-wide scheduling reads (`TenantScope::Any`).
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    retention: RetentionPolicy,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, retention: RetentionPolicy) -> Self {
        Self {
            pool: Arc::new(pool),
            retention,
        }
    }

    /// Connect, then create the table and indexes if they are missing.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        retention: RetentionPolicy,
    ) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool, retention);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn insert_one(
        tx: &mut Transaction<'_, Postgres>,
        job: &mut Job,
        retention: &RetentionPolicy,
    ) -> Result<(), JobStoreError> {
        job.version = 1;
        job.apply_retention(retention);

        sqlx::query(
            r#"
            INSERT INTO recognition_jobs (
                id, tenant_id, status, priority, model_type, subject_id, initiated_by,
                name, description, attempt_count, max_attempts, scheduled_for,
                next_retry_at, started_at, created_at, updated_at, version, document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.status.as_str())
        .bind(i16::from(job.priority.value()))
        .bind(job.model_type.as_str())
        .bind(job.subject_id.as_uuid())
        .bind(job.initiated_by.map(|u| *u.as_uuid()))
        .bind(&job.name)
        .bind(job.description.as_deref())
        .bind(to_i32(job.attempt_count))
        .bind(to_i32(job.max_attempts))
        .bind(job.scheduled_for)
        .bind(job.next_retry_at)
        .bind(job.started_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(to_i64(job.version))
        .bind(Json(&*job))
        .execute(&mut **tx)
        .await
        .map_err(|e| match map_sqlx_error("insert_job", e) {
            JobStoreError::AlreadyExists(_) => JobStoreError::AlreadyExists(job.id),
            other => other,
        })?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id), err)]
    async fn insert(&self, job: &mut Job) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Self::insert_one(&mut tx, job, &self.retention).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    async fn insert_batch(&self, jobs: &mut [Job]) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        for job in jobs.iter_mut() {
            // Dropping `tx` on error rolls the whole batch back.
            Self::insert_one(&mut tx, job, &self.retention).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT tenant_id, version, document FROM recognition_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let owner: Uuid = row
            .try_get("tenant_id")
            .map_err(|e| JobStoreError::Storage(format!("failed to read tenant_id: {e}")))?;
        if owner != *tenant_id.as_uuid() {
            return Err(JobStoreError::TenantIsolation(job_id));
        }
        job_from_row(&row).map(Some)
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, tenant_id = %job.tenant_id, expected = ?expected),
        err
    )]
    async fn save_versioned(
        &self,
        job: &mut Job,
        expected: ExpectedVersion,
    ) -> Result<(), JobStoreError> {
        let mut candidate = job.clone();
        candidate.apply_retention(&self.retention);

        let expected_param: Option<i64> = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(to_i64(v)),
        };

        // The stored document carries the post-update version.
        let row = sqlx::query(
            r#"
            UPDATE recognition_jobs SET
                status = $3,
                priority = $4,
                name = $5,
                description = $6,
                attempt_count = $7,
                max_attempts = $8,
                scheduled_for = $9,
                next_retry_at = $10,
                started_at = $11,
                updated_at = $12,
                version = version + 1,
                document = jsonb_set($13::jsonb, '{version}', to_jsonb(version + 1))
            WHERE id = $1 AND tenant_id = $2 AND ($14::bigint IS NULL OR version = $14)
            RETURNING version
            "#,
        )
        .bind(candidate.id.as_uuid())
        .bind(candidate.tenant_id.as_uuid())
        .bind(candidate.status.as_str())
        .bind(i16::from(candidate.priority.value()))
        .bind(&candidate.name)
        .bind(candidate.description.as_deref())
        .bind(to_i32(candidate.attempt_count))
        .bind(to_i32(candidate.max_attempts))
        .bind(candidate.scheduled_for)
        .bind(candidate.next_retry_at)
        .bind(candidate.started_at)
        .bind(candidate.updated_at)
        .bind(Json(&candidate))
        .bind(expected_param)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_job", e))?;

        if let Some(row) = row {
            let version: i64 = row
                .try_get("version")
                .map_err(|e| JobStoreError::Storage(format!("failed to read version: {e}")))?;
            candidate.version = version.max(0) as u64;
            *job = candidate;
            return Ok(());
        }

        let current = sqlx::query("SELECT tenant_id, version FROM recognition_jobs WHERE id = $1")
            .bind(job.id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_job_check", e))?;

        match current {
            None => Err(JobStoreError::NotFound(job.id)),
            Some(row) => {
                let owner: Uuid = row
                    .try_get("tenant_id")
                    .map_err(|e| JobStoreError::Storage(format!("failed to read tenant_id: {e}")))?;
                if owner != *job.tenant_id.as_uuid() {
                    return Err(JobStoreError::TenantIsolation(job.id));
                }
                let actual: i64 = row
                    .try_get("version")
                    .map_err(|e| JobStoreError::Storage(format!("failed to read version: {e}")))?;
                Err(JobStoreError::Conflict {
                    job_id: job.id,
                    expected,
                    actual: actual.max(0) as u64,
                })
            }
        }
    }

    #[instrument(skip(self, excluding), fields(scope = ?scope, excluded = excluding.len()), err)]
    async fn eligible(
        &self,
        scope: TenantScope,
        now: DateTime<Utc>,
        limit: usize,
        excluding: &[TenantId],
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT version, document FROM recognition_jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND NOT (tenant_id = ANY($4::uuid[]))
              AND ({ELIGIBLE_PREDICATE})
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(scope.tenant().map(|t| *t.as_uuid()))
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(excluding.iter().map(|t| *t.as_uuid()).collect::<Vec<Uuid>>())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("eligible_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    async fn search(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, JobStoreError> {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        let model_type = filter.model_type.map(|m| m.as_str());
        let priority = filter.priority.map(|p| i16::from(p.value()));
        let subject_id = filter.subject_id.map(|s| *s.as_uuid());
        let initiated_by = filter.initiated_by.map(|u| *u.as_uuid());
        let text = filter.text.as_deref().map(like_pattern);

        let count_sql = format!("SELECT COUNT(*) AS total FROM recognition_jobs WHERE {FILTER_PREDICATE}");
        let count_row = sqlx::query(&count_sql)
            .bind(tenant_id.as_uuid())
            .bind(&statuses)
            .bind(model_type)
            .bind(priority)
            .bind(subject_id)
            .bind(initiated_by)
            .bind(text.as_deref())
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.can_execute)
            .bind(filter.can_retry)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;

        let page_sql = format!(
            r#"
            SELECT version, document FROM recognition_jobs
            WHERE {FILTER_PREDICATE}
            ORDER BY created_at DESC, id DESC
            LIMIT $12 OFFSET $13
            "#
        );
        let rows = sqlx::query(&page_sql)
            .bind(tenant_id.as_uuid())
            .bind(&statuses)
            .bind(model_type)
            .bind(priority)
            .bind(subject_id)
            .bind(initiated_by)
            .bind(text.as_deref())
            .bind(filter.created_after)
            .bind(filter.created_before)
            .bind(filter.can_execute)
            .bind(filter.can_retry)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("search_jobs", e))?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        let total = total.max(0) as u64;
        let has_more = total > u64::from(page.offset) + jobs.len() as u64;

        Ok(JobPage {
            jobs,
            total,
            pagination: page,
            has_more,
        })
    }

    #[instrument(skip(self), fields(scope = ?scope, status = %status), err)]
    async fn list_in_status(
        &self,
        scope: TenantScope,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT version, document FROM recognition_jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1) AND status = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(scope.tenant().map(|t| *t.as_uuid()))
        .bind(status.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_in_status", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM recognition_jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(format!("failed to read status: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
            let Some(status) = JobStatus::parse(&status) else {
                return Err(JobStoreError::Storage(format!("unknown job status {status:?}")));
            };
            stats.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let Json(mut job): Json<Job> = row
        .try_get("document")
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job document: {e}")))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| JobStoreError::Storage(format!("failed to read version: {e}")))?;
    job.version = version.max(0) as u64;
    Ok(job)
}

/// `%text%` with LIKE metacharacters escaped.
fn like_pattern(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation; the caller fills in the id.
                Some("23505") => JobStoreError::AlreadyExists(JobId::from_uuid(Uuid::nil())),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
