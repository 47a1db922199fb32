use std::path::Path;

use shard_catalog::file_io::open_file_for_append;
use shard_catalog::start_server;
use shard_catalog::Cluster;
use shard_catalog::Error;
use shard_catalog::Result;
use shard_catalog::Settings;
use shard_catalog::SystemError;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let settings = Settings::new()?.validate()?;

    // Initializing Logs
    let _guard = init_observability(
        &settings.cluster.node_name,
        &settings.cluster.log_dir,
        &settings.monitoring.log_filter,
    )?;

    // Initializing Shutdown Signal
    let (graceful_tx, graceful_rx) = watch::channel(());
    let shutdown = CancellationToken::new();

    let monitoring = settings.monitoring.clone();
    let cluster = Cluster::open(settings).await?;

    let mut handles = Vec::new();
    if monitoring.prometheus_enabled {
        let rx = graceful_rx.clone();
        handles.push(tokio::spawn(async move {
            start_server(monitoring.prometheus_port, rx).await;
        }));
    }
    cluster.spawn_range_deleters(shutdown.clone(), &mut handles);

    info!("{:?} started. Waiting for CTRL+C signal...", cluster);
    // Listen on Shutdown Signal
    if let Err(e) = graceful_shutdown(graceful_tx).await {
        error!("Failed to shutdown: {:?}", e);
    }
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("background task stopped abnormally: {:?}", e);
        }
    }
    cluster.flush()?;

    println!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown(graceful_tx: watch::Sender<()>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
    }

    info!("Shutdown server..");
    graceful_tx.send(()).map_err(|e| {
        error!("Failed to send shutdown signal: {}", e);
        Error::System(SystemError::SignalSendFailed(format!(
            "Failed to send shutdown signal: {e}"
        )))
    })?;

    info!("Shutdown completed");
    Ok(())
}

/// Logs go to `<log_dir>/<node_name>/shard.log`. `RUST_LOG` overrides the
/// configured filter.
pub fn init_observability(
    node_name: &str,
    log_dir: &Path,
    default_filter: &str,
) -> Result<WorkerGuard> {
    let log_file = open_file_for_append(log_dir.join(node_name).join("shard.log"))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(filter);
    tracing_subscriber::registry().with(base_subscriber).init();

    Ok(guard)
}
