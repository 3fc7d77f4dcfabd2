use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tabsyn_pipeline::SubprocessRunner;
use tabsyn_worker::config::WorkerConfig;
use tabsyn_worker::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabsyn_worker=debug,tabsyn_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(
        cpu_limit = config.cpu_limit,
        gpu_limit = config.gpu_limit,
        timeout_secs = config.pipeline_timeout.as_secs(),
        "Loaded worker configuration",
    );

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = tabsyn_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tabsyn_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tabsyn_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database ready");

    let registry = Arc::new(tabsyn_db::PgJobRegistry::new(pool));
    let runner = Arc::new(SubprocessRunner::new(config.runner()));
    let bus = Arc::new(tabsyn_events::EventBus::default());

    let scheduler = Scheduler::start(registry, runner, bus, config);
    tracing::info!("Worker pool started");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining workers");

    scheduler.shutdown().await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the worker
/// drains cleanly whether stopped interactively or by a process manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
