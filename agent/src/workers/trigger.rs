//! Deployment trigger workers: one poll loop per configured repository,
//! plus the forwarder that turns image-update events into deployments.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::model::event::ImageUpdateEvent;
use crate::trigger::DeploymentTrigger;

/// Trigger worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often to check whether an application should be synced
    pub sync_interval: Duration,

    /// Initial delay before the first poll
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Run the poll loop for one repository
pub async fn run<S, F>(
    options: &Options,
    trigger: Arc<DeploymentTrigger>,
    repo_id: String,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("trigger worker for {} starting...", repo_id);

    sleep_fn(options.initial_delay).await;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("trigger worker for {} shutting down...", repo_id);
                return;
            }
            _ = sleep_fn(options.sync_interval) => {}
        }

        debug!("checking {} for changes...", repo_id);

        match trigger.tick_repo(&repo_id).await {
            Ok(0) => debug!("no deployments triggered for {}", repo_id),
            Ok(n) => info!("triggered {} deployments for {}", n, repo_id),
            Err(e) => error!("trigger tick for {} failed: {}", repo_id, e),
        }
    }
}

/// Forward image-update events into the trigger until shutdown
pub async fn run_image_events(
    trigger: Arc<DeploymentTrigger>,
    mut events: mpsc::Receiver<ImageUpdateEvent>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("image event forwarder starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("image event forwarder shutting down...");
                return;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    info!("image event channel closed");
                    return;
                };
                if let Err(e) = trigger.trigger_for_image(&event).await {
                    error!("image-triggered deployment failed: {}", e);
                }
            }
        }
    }
}
