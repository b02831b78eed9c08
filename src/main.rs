use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otpguard::config::{LogFormat, LoggingConfig, OtpGuardConfig};
use otpguard::grpc::{GrpcDecisionAdapter, GrpcServer};
use otpguard::ratelimit::OtpRateLimiter;

/// Admission control service for one-time passcode issuance.
#[derive(Debug, Parser)]
#[command(name = "otpguard", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration problems are fatal before anything starts.
    let mut config = OtpGuardConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting otpguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        count_mode = ?config.rate_limiting.count_mode,
        max_requests = config.rate_limiting.max_requests,
        window_secs = config.rate_limiting.window_secs,
        min_interval_secs = config.rate_limiting.min_interval_secs,
        "Configuration loaded"
    );

    // Initialize the rate limiter
    let mut limiter = OtpRateLimiter::from_config(&config);
    if let Some(adapter) = GrpcDecisionAdapter::from_config(&config.external)? {
        limiter = limiter.with_adapter(Arc::new(adapter), config.external.adapter_settings());
    } else {
        info!("No external decision service configured, using local policy only");
    }
    let limiter = Arc::new(limiter);
    let reaper = limiter.spawn_reaper(config.reaper.reaper());
    info!("Rate limiter initialized");

    // Run the server with graceful shutdown on Ctrl+C
    let server = GrpcServer::new(config.server.grpc_addr, limiter);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    reaper.shutdown().await;
    served?;

    info!("otpguard stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
