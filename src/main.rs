//! Binocular eye tracker: grabs, processes and reports until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use binoc::{Config, EyeTracker};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("binoc=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("binoc launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    binoc::CONFIG.store(Arc::new(config));

    let config = binoc::CONFIG.load_full();
    #[cfg(feature = "v4l2")]
    for (device, format) in binoc::utils::detect_cameras(2) {
        info!("Available camera: {} ({:?})", device, format);
    }

    let tracker = Arc::new(EyeTracker::new((*config).clone()));
    tracker.start()?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
            _ = ticker.tick() => {
                info!("{}", tracker.status());
                if tracker.is_finished() {
                    info!("Sources finished");
                    break;
                }
            }
        }
    }

    // Stopping joins OS threads, keep it off the runtime workers
    let stopping = tracker.clone();
    let result = tokio::task::spawn_blocking(move || stopping.stop()).await?;
    if let Err(err) = &result {
        warn!(error = %err, "Tracking failed");
    }
    result?;

    info!("binoc shutting down");
    Ok(())
}
