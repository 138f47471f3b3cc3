use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engagement_service::config::{Config, StorageBackend};
use engagement_service::notifier::LogAlertSink;
use engagement_service::repository::{MemoryStore, PgStore, Repositories};
use engagement_service::{EngagementEngine, SystemClock};

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,engagement_service=debug,sqlx=warn".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

async fn build_repositories(config: &Config) -> anyhow::Result<Repositories> {
    match config.database.backend {
        StorageBackend::Postgres => {
            let store = PgStore::connect(&config.database)
                .await
                .context("Failed to connect to database")?;
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
                info!("Database migrations applied");
            }
            Ok(Repositories::from_store(Arc::new(store)))
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; state is lost on exit");
            Ok(Repositories::from_store(Arc::new(MemoryStore::new())))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let log_format = config
        .as_ref()
        .map(|c| c.service.log_format.clone())
        .unwrap_or_else(|_| "json".to_string());
    init_tracing(&log_format);

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Configuration loading failed: {:#}", e);
            return Err(e);
        }
    };

    info!(
        "Starting {} v{}",
        config.service.service_name,
        env!("CARGO_PKG_VERSION")
    );
    info!("Environment: {}", config.service.env);

    let repos = build_repositories(&config).await?;
    let engine = EngagementEngine::new(
        config,
        repos,
        Arc::new(SystemClock),
        Arc::new(LogAlertSink),
    );

    let scheduler = engine.scheduler().start();
    info!(jobs = scheduler.job_count(), "Engagement jobs running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, waiting for in-flight runs");

    scheduler.shutdown().await;

    match engine.run_health_check().await {
        Ok(snapshot) => {
            for m in snapshot {
                info!(
                    subsystem = %m.subsystem,
                    status = m.status.as_str(),
                    success_rate = m.success_rate,
                    "Final subsystem health"
                );
            }
        }
        Err(e) => error!(error = %e, "Final health check failed"),
    }
    info!(metrics = %engine.metrics_text(), "Final job metrics");

    info!("Engagement service stopped");
    Ok(())
}
