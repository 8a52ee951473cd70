use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use jobrunner::app;
use jobrunner::config::AppConfig;
use jobrunner::jobs;
use jobrunner::logging::{self, LoggingConfig};
use jobrunner::registry::HandlerRegistry;
use jobrunner::services::job_scheduler_service::JobSchedulerService;
use jobrunner::state::AppState;
use jobrunner::store::{JobStore, PgJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging FIRST
    logging::init_logging(LoggingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = AppConfig::from_env().map_err(anyhow::Error::msg)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.api_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let mut registry = HandlerRegistry::new();
    jobs::register_all(&mut registry);
    let registry = Arc::new(registry);

    // The scheduler gets its own pool so polling never starves request handlers
    let scheduler_store: Arc<dyn JobStore> = Arc::new(PgJobStore::connect_lazy(
        &config.database_url,
        config.scheduler.max_connections,
    )?);
    let scheduler = JobSchedulerService::new(
        scheduler_store,
        registry.clone(),
        config.scheduler.clone(),
    )
    .start();

    let state = AppState {
        store: Arc::new(PgJobStore::new(pool)),
        registry,
    };
    let app = app::create_app(state);

    let addr: SocketAddr = config.bind_addr;
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("🚀 Job runner backend running at http://{}/", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
