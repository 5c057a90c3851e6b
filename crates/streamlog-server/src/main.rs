//! StreamLog Server
//!
//! Runs the stream engine until SIGINT or SIGTERM, then closes every stream
//! (flushing queued records) and stops the storage provider.
//!
//! ## Configuration
//!
//! - `STREAMLOG_CONFIG`: TOML file (default: streamlog.toml, optional)
//! - `STREAMLOG_STORAGE_TYPE`: `file`, `relational` or `in-memory`
//! - `STREAMLOG_DATA_DIR`: file backend directory
//! - `STREAMLOG_DSN`: SQLite connection string
//!
//! ## Logging
//!
//! ```bash
//! RUST_LOG=debug streamlog-server                   # flushes and iterator activity
//! RUST_LOG=info streamlog-server                    # default
//! RUST_LOG=streamlog_storage=warn streamlog-server  # quiet storage layer
//! ```

use streamlog_server::{ServiceConfig, ServiceError, StreamService};
use streamlog_storage::ProviderRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    tracing::info!(
        storage = %config.storage.storage_type,
        bulk_flush_frequency = config.streams.bulk_flush_frequency,
        bulk_max_size = config.streams.bulk_max_size,
        "Starting StreamLog"
    );

    let registry = ProviderRegistry::with_defaults();
    let service = StreamService::from_registry(config, &registry)?;

    match service.init().await {
        Ok(()) => {}
        // Streams that did start keep serving
        Err(e @ ServiceError::StartFailed { .. }) => {
            tracing::error!(error = %e, "Some streams failed to start");
        }
        Err(e) => return Err(e.into()),
    }

    wait_for_shutdown_signal().await;

    tracing::info!("Closing streams...");
    service.stop().await?;
    tracing::info!("StreamLog shut down gracefully");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
