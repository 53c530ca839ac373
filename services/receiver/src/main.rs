use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use concat_core::ReceiverConfig;
use receiver::ReceiverApp;

/// Log-aggregation relay: accepts framed MessagePack batches over TCP,
/// reassembles multi-line records, and routes them by tag.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a TOML config file. Omit to run with every default.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "receiver starting");

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => ReceiverConfig::load_from_path(&path).unwrap_or_else(|e| {
            error!(error = %e, path = %path.display(), "FATAL: failed to load config");
            std::process::exit(1);
        }),
        None => ReceiverConfig::default(),
    };
    info!(addr = %config.addr, n_fork_concat = config.n_fork_concat, n_fork_dispatch = config.n_fork_dispatch, "config loaded");

    let root_cancel = CancellationToken::new();
    let app = ReceiverApp::build(config, root_cancel.clone());
    let handles = app.spawn();

    shutdown_signal().await;
    info!("shutdown signal received, cancelling all tasks");
    root_cancel.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    info!("receiver shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received Ctrl+C"); },
        () = terminate => { info!("received SIGTERM"); },
    }
}
