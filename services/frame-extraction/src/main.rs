//! Frame Extraction Service
//!
//! Samples frames from the configured video streams, runs them through the
//! enhancement and feature pipeline and keeps the most recent results in
//! memory until every stream is done or the process is signalled.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with EXTRACT_)
//!
//! See `config.rs` for detailed configuration options.

use frame_extraction::config::{LoggingConfig, ServiceConfig};
use frame_extraction::{SessionMonitor, SessionRegistry};
use futures::future::join_all;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "frame-extraction",
        version = env!("CARGO_PKG_VERSION"),
        streams = config.streams.len(),
        "Starting frame extraction service"
    );

    // Validate configuration
    config.validate()?;

    let registry = SessionRegistry::new(&config);
    let monitors = start_streams(&registry, &config).await;
    if monitors.is_empty() {
        warn!("No extraction sessions running, waiting for shutdown signal");
    }

    let all_done = async {
        join_all(monitors.iter().map(|m| m.wait())).await;
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
        }
        _ = all_done, if !monitors.is_empty() => {
            info!("All configured streams finished");
        }
    }

    registry.shutdown().await;
    log_final_stats(&registry);

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration.
fn load_config() -> anyhow::Result<ServiceConfig> {
    // Try loading from files first, fall back to environment
    let config = ServiceConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        ServiceConfig::from_env()
    })?;

    Ok(config)
}

fn log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("frame_extraction={}", log_level(&config.level)).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Start every configured stream in background mode.
async fn start_streams(registry: &SessionRegistry, config: &ServiceConfig) -> Vec<SessionMonitor> {
    let mut monitors = Vec::with_capacity(config.streams.len());

    for stream in &config.streams {
        match registry
            .start(&stream.id, &stream.url, stream.extraction.clone())
            .await
        {
            Ok(monitor) => {
                info!(
                    stream_id = %stream.id,
                    session_id = %monitor.session_id(),
                    "Stream extraction accepted"
                );
                monitors.push(monitor);
            }
            Err(e) => {
                error!(stream_id = %stream.id, error = %e, "Failed to start stream extraction");
            }
        }
    }

    monitors
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal");
}

/// Log final statistics on shutdown.
fn log_final_stats(registry: &SessionRegistry) {
    info!("=== Final Statistics ===");

    let status = registry.status();
    info!(
        running = status.running,
        cached = status.cached,
        "Registry final stats"
    );

    let stats = registry.processor_stats();
    info!(
        frames_processed = stats.frames_processed,
        frames_degraded = stats.frames_degraded,
        avg_processing_time_us = format!("{:.2}", stats.avg_processing_time_us),
        "Processor final stats"
    );
}
