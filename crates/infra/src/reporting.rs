//! Read-only aggregates over stored jobs for dashboards and exports.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use plansight_ai::{Job, JobId, JobStatus, ModelType, Priority};
use plansight_core::TenantId;

const TOP_ERRORS: usize = 10;

/// Aggregate statistics over a set of jobs.
///
/// Averages are 0 when there is nothing to average.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_model_type: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<u8, usize>,
    /// Completed / (Completed + terminally Failed).
    pub success_rate: f64,
    /// Failed jobs still waiting for another attempt.
    pub awaiting_retry: usize,
    pub average_processing_seconds: f64,
    /// Mean of per-job average detection confidence over completed jobs.
    pub average_confidence: f64,
    pub total_detections: usize,
}

impl JobStatistics {
    pub fn from_jobs<'a, I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a Job>,
    {
        let mut stats = JobStatistics::default();
        let mut completed = 0usize;
        let mut terminal_failures = 0usize;
        let mut processing_seconds: Vec<i64> = Vec::new();
        let mut confidences: Vec<f64> = Vec::new();

        for job in jobs {
            stats.total += 1;
            *stats.by_status.entry(job.status.as_str().to_string()).or_default() += 1;
            *stats.by_model_type.entry(job.model_type.as_str().to_string()).or_default() += 1;
            *stats.by_priority.entry(job.priority.value()).or_default() += 1;

            match job.status {
                JobStatus::Completed => completed += 1,
                JobStatus::Failed if job.can_retry() => stats.awaiting_retry += 1,
                JobStatus::Failed => terminal_failures += 1,
                _ => {}
            }
            if let Some(secs) = job.processing_time_seconds {
                processing_seconds.push(secs);
            }
            if let Some(results) = &job.results {
                stats.total_detections += results.statistics.count;
                if results.statistics.count > 0 {
                    confidences.push(results.statistics.confidence_avg);
                }
            }
        }

        let finished = completed + terminal_failures;
        stats.success_rate = ratio(completed as f64, finished);
        stats.average_processing_seconds =
            ratio(processing_seconds.iter().sum::<i64>() as f64, processing_seconds.len());
        stats.average_confidence = ratio(confidences.iter().sum(), confidences.len());
        stats
    }
}

fn ratio(sum: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        let value = sum / count as f64;
        if value.is_finite() { value } else { 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrequency {
    pub message: String,
    pub count: usize,
}

/// Most frequent error messages across all attempts, most common first.
pub fn top_errors<'a, I>(jobs: I, limit: usize) -> Vec<ErrorFrequency>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for job in jobs {
        for record in &job.error_history {
            *counts.entry(record.message.as_str()).or_default() += 1;
        }
    }

    let mut frequencies: Vec<ErrorFrequency> = counts
        .into_iter()
        .map(|(message, count)| ErrorFrequency {
            message: message.to_string(),
            count,
        })
        .collect();
    frequencies.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    frequencies.truncate(limit);
    frequencies
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReportRow {
    pub id: JobId,
    pub name: String,
    pub model_type: ModelType,
    pub status: JobStatus,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_seconds: Option<i64>,
    pub detections: Option<usize>,
    pub last_error: Option<String>,
}

impl From<&Job> for JobReportRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            model_type: job.model_type,
            status: job.status,
            priority: job.priority,
            attempts: job.attempt_count,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            completed_at: job.completed_at,
            processing_time_seconds: job.processing_time_seconds,
            detections: job.results.as_ref().map(|r| r.statistics.count),
            last_error: job.error_history.last().map(|e| e.message.clone()),
        }
    }
}

/// Report over the jobs created in `[from, to]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub tenant_id: TenantId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub statistics: JobStatistics,
    pub top_errors: Vec<ErrorFrequency>,
    pub jobs: Vec<JobReportRow>,
}

impl JobReport {
    pub fn generate(
        tenant_id: TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        jobs: &[Job],
        generated_at: DateTime<Utc>,
    ) -> Self {
        let mut rows: Vec<JobReportRow> = jobs.iter().map(JobReportRow::from).collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        Self {
            tenant_id,
            from,
            to,
            generated_at,
            statistics: JobStatistics::from_jobs(jobs),
            top_errors: top_errors(jobs, TOP_ERRORS),
            jobs: rows,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
