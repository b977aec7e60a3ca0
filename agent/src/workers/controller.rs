//! Controller worker: pulls not-completed deployments and hands them to the
//! scheduler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::controller::Scheduler;

/// Controller worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval for the deployment pull loop
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Run the controller worker
pub async fn run<S, F>(
    options: &Options,
    scheduler: Arc<Scheduler>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("controller worker starting...");

    // Reclaim deployments still assigned to this piped from a previous run
    // before settling into the poll cadence.
    match scheduler.tick().await {
        Ok(0) => {}
        Ok(n) => info!("reclaimed {} deployments", n),
        Err(e) => error!("deployment reclaim failed: {}", e),
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("controller worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        debug!("checking for deployments...");

        match scheduler.tick().await {
            Ok(0) => {}
            Ok(n) => info!("started {} deployment drivers", n),
            Err(e) => error!("deployment poll failed: {}", e),
        }
    }
}
