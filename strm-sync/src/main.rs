use strm_sync::database;
use strm_sync::logging;
use strm_sync::services::ServiceContainer;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let logging_config = logging::init_logging(&log_dir)?;
    let logging_cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(logging_cancel.clone());

    // Initialize database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:strm-sync.db?mode=rwc".to_string());

    let pool = database::init_pool(&database_url).await?;

    // Run migrations
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool).await?;
    container.initialize().await?;

    tracing::info!("strm-sync started");

    wait_for_shutdown(&logging_config).await?;
    tracing::info!("Shutdown signal received");

    container.shutdown().await?;
    logging_cancel.cancel();

    Ok(())
}

/// Wait for Ctrl-C. On Unix, SIGHUP re-reads `RUST_LOG` and swaps the log
/// filter in place.
#[cfg(unix)]
async fn wait_for_shutdown(logging: &logging::LoggingConfig) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => reload_log_filter(logging),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_logging: &logging::LoggingConfig) -> anyhow::Result<()> {
    Ok(tokio::signal::ctrl_c().await?)
}

fn reload_log_filter(logging: &logging::LoggingConfig) {
    dotenvy::dotenv_override().ok();
    let directive =
        std::env::var("RUST_LOG").unwrap_or_else(|_| logging::DEFAULT_LOG_FILTER.to_string());
    if let Err(e) = logging.set_filter(&directive) {
        tracing::warn!(error = %e, current = %logging.get_filter(), "Keeping current log filter");
    }
}
