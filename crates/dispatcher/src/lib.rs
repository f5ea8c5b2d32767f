//! Process wiring for the plansight dispatcher.
//!
//! Builds the job store (Postgres when a database URL is configured,
//! in-memory otherwise), the worker client, the execution coordinator and
//! the `JobService` from one `AppConfig`.

use std::sync::Arc;

use anyhow::Context;

use plansight_infra::jobs::{
    ConcurrencyGate, Dispatcher, DispatcherConfig, ExecutionCoordinator, ExecutionSettings,
    InMemoryJobStore, JobService, JobStore, PostgresJobStore,
};
use plansight_infra::{AppConfig, HttpRecognitionWorker, InMemorySubjectRepository, SubjectRepository};

/// Everything a running dispatcher process owns.
pub struct App {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub service: JobService,
    pub dispatcher: Dispatcher,
}

pub async fn build_app(config: &AppConfig) -> anyhow::Result<App> {
    let subjects: Arc<dyn SubjectRepository> = Arc::new(InMemorySubjectRepository::new());
    build_app_with_subjects(config, subjects).await
}

pub async fn build_app_with_subjects(
    config: &AppConfig,
    subjects: Arc<dyn SubjectRepository>,
) -> anyhow::Result<App> {
    let store: Arc<dyn JobStore> = match config.database.url.as_deref() {
        Some(url) => {
            let store = PostgresJobStore::connect(
                url,
                config.database.max_connections,
                config.retention.clone(),
            )
            .await
            .context("failed to open the Postgres job store")?;
            tracing::info!("using Postgres job store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("no database URL configured; jobs are kept in memory only");
            Arc::new(InMemoryJobStore::with_retention(config.retention.clone()))
        }
    };

    let worker = HttpRecognitionWorker::new(&config.worker)
        .context("failed to build the recognition worker client")?;

    let coordinator = ExecutionCoordinator::new(
        store,
        Arc::new(worker),
        Arc::clone(&subjects),
        ConcurrencyGate::new(config.execution.max_concurrent_jobs),
        config.retry.clone(),
        ExecutionSettings::from_config(config),
    );
    let service = JobService::new(Arc::clone(&coordinator), subjects, config.retention.clone());
    let dispatcher = Dispatcher::new(Arc::clone(&coordinator), DispatcherConfig::from_config(config));

    Ok(App {
        coordinator,
        service,
        dispatcher,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plansight_ai::{JobStatus, ModelType, NewJob};
    use plansight_core::TenantId;
    use plansight_infra::Subject;

    #[tokio::test]
    async fn builds_in_memory_app_from_defaults() {
        let subjects = Arc::new(InMemorySubjectRepository::new());
        let tenant = TenantId::new();
        let subject = Subject::new(tenant, "plan", "s3://plan.pdf", "application/pdf");
        subjects.insert(subject.clone());

        let app = build_app_with_subjects(&AppConfig::default(), subjects)
            .await
            .unwrap();

        let job = app
            .service
            .create(tenant, NewJob::new("sheet", subject.id, ModelType::TextExtraction))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(app.coordinator.gate().limit(), 3);
    }

    #[test]
    fn example_config_keeps_the_exact_backoff_schedule() {
        let raw = include_str!("../plansight.example.toml");
        let config = AppConfig::from_toml(raw).unwrap();

        let delays: Vec<u64> = (1..=4)
            .map(|n| config.retry.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240]);
        assert_eq!(config.retry.delay_for_attempt(12).as_secs(), 3600);
    }
}
