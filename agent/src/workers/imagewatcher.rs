//! Image watcher worker: one poll loop per configured image provider.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::imagewatcher::ImageWatcher;

/// Image watcher worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Registry polling interval for this provider
    pub pull_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pull_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Run the watcher loop for one image provider
pub async fn run<S, F>(
    options: &Options,
    watcher: Arc<ImageWatcher>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("image watcher starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("image watcher shutting down...");
                return;
            }
            _ = sleep_fn(options.pull_interval) => {}
        }

        debug!("polling image registry...");

        match watcher.tick().await {
            Ok(0) => {}
            Ok(n) => info!("observed {} image updates", n),
            Err(e) => error!("image poll failed: {}", e),
        }
    }
}
