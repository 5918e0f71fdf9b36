//! Weaver conversion service
//!
//! Accepts HTML conversion requests over HTTP and runs them through a bounded
//! pool of workers that shell out to an HTML converter CLI.
//!
//! ## Architecture
//!
//! - **Queue**: in-process bounded FIFO with `WEAVER_MAX_WORKERS` workers
//! - **Converter**: `WEAVER_CONVERSION_CMD`, output read from stdout
//! - **Storage**: optional Redis artifact store (`REDIS_URL`)
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! See `weaver::config` for the full list of environment variables.
//! `RUST_LOG` sets the log level (default: info).

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weaver::config::{Config, LogFormat};
use weaver::converter::CliConverter;
use weaver::queue::WorkQueue;
use weaver::server::{self, AppState};
use weaver::store::RedisStore;
use weaver::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    init_tracing(config.log_format);

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!(
        http_addr = %config.http_addr,
        max_workers = config.max_workers,
        max_conversion_queue = config.max_conversion_queue,
        worker_timeout_secs = config.worker_timeout.as_secs(),
        command = %config.conversion_cmd,
        "Starting conversion service"
    );

    let mut converter = CliConverter::new(config.conversion_cmd.clone());
    if let Some(url) = &config.redis_url {
        let store = RedisStore::connect(url, config.upload_ttl_seconds).await?;
        converter = converter.with_store(Arc::new(store));
    }

    let queue = Arc::new(WorkQueue::start(config.queue_settings(), Arc::new(converter)));
    let app = server::router(AppState::new(queue.clone(), config.auth_key.clone()));

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr))?;
    info!("Listening on {}", config.http_addr);

    // Draining starts with the signal so requests still waiting on jobs get
    // their results while the listener stops accepting connections.
    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            stop.cancel();
        }
    });
    let drainer = tokio::spawn({
        let queue = queue.clone();
        let stop = stop.clone();
        let grace = config.shutdown_grace;
        async move {
            stop.cancelled().await;
            info!("Received shutdown signal, draining conversion queue...");
            queue.drain(grace).await;
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("HTTP server failed")?;

    drainer.await.context("Queue drain task failed")?;

    telemetry::shutdown_telemetry();
    info!("Conversion service shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
