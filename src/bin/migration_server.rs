//! Migration server binary.
//!
//! Loads the YAML configuration, connects to Postgres, wires the pipeline
//! and serves the migration API. SIGINT/SIGTERM trigger a graceful drain:
//! no new sheets start, in-flight sheets get the configured grace period.

use std::sync::Arc;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multisheet_migration::api::{create_migration_router, AppState};
use multisheet_migration::config::MigrationConfig;
use multisheet_migration::jobs::JobManager;
use multisheet_migration::master::MasterWriterRegistry;
use multisheet_migration::pipeline::{SheetPipeline, SheetScheduler};
use multisheet_migration::progress::ProgressStore;
use multisheet_migration::staging::StagingStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multisheet_migration=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("MIGRATION_CONFIG").unwrap_or_else(|_| "config/migration.yaml".to_string());
    let config = Arc::new(MigrationConfig::from_file(&config_path)?);
    tracing::info!(
        config = %config_path,
        sheet_types = config.sheet_types.len(),
        "configuration loaded"
    );

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/multisheet_migration".to_string());
    let pool = sqlx::PgPool::connect(&database_url).await?;
    tracing::info!("database connection established");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let staging = StagingStore::new(pool.clone());
    let progress = ProgressStore::new(pool.clone());
    let pipeline = Arc::new(SheetPipeline::new(
        config.clone(),
        staging.clone(),
        progress.clone(),
        MasterWriterRegistry::new(),
    ));
    let scheduler = Arc::new(SheetScheduler::new(
        config.clone(),
        pipeline,
        progress.clone(),
    ));
    let manager = Arc::new(JobManager::new(
        config.clone(),
        pool.clone(),
        progress,
        scheduler,
        shutdown_rx,
    ));

    let state = AppState::new(config.clone(), pool, manager);
    let app = create_migration_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!(addr = %config.server.bind_addr, "migration server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(%e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
