use std::path::PathBuf;

use anyhow::Context;

use plansight_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PLANSIGHT_CONFIG").ok())
        .map(PathBuf::from);

    let config = AppConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    plansight_observability::init(config.logging.format);

    tracing::info!(
        worker_url = %config.worker.base_url,
        max_concurrent_jobs = config.execution.max_concurrent_jobs,
        poll_interval_secs = config.scheduler.poll_interval_secs,
        "starting plansight dispatcher"
    );

    let app = plansight_dispatcher::build_app(&config).await?;
    let handle = app.dispatcher.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining running attempts");

    handle.shutdown().await;
    Ok(())
}
