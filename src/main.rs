use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use liveview::config::OutputConfig;
use liveview::output;

#[derive(Parser, Debug)]
#[command(name = "liveview")]
#[command(about = "Live camera and birdseye streams over WebSocket")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "liveview.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("liveview=info")),
        )
        .init();

    let args = Args::parse();
    let config = OutputConfig::load(&args.config)?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("Termination requested");
        let _ = shutdown_tx.send(true);
    });

    // Frame announcements arrive on stdin, one JSON record per line. The
    // reader thread is detached: an idle producer must not delay exit.
    let (queue_tx, queue_rx) = mpsc::channel(config.queue.capacity.max(1));
    std::thread::Builder::new()
        .name("metadata-input".into())
        .spawn(move || {
            if let Err(e) = output::forward_records(std::io::stdin().lock(), queue_tx) {
                tracing::error!(error = %e, "Metadata input failed");
            }
        })?;

    output::run(config, queue_rx, shutdown_rx).await?;
    tracing::info!("Exiting output process");
    Ok(())
}
