//! Live-state worker: keeps one reporter task per introspectable
//! application, reconciling the set as applications come and go.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::client::ApiClient;
use crate::appstore::ApplicationStore;
use crate::cancel::{CancelHandle, Cancellation};
use crate::git::GitWorkspaces;
use crate::livestate::{AppStateReporter, LiveStateOptions};
use crate::model::application::Application;
use crate::providers::{PlatformProvider, ProviderRegistry};
use crate::trigger::DeploymentTrigger;

/// Live-state worker options
#[derive(Debug, Clone)]
pub struct Options {
    pub livestate: LiveStateOptions,

    /// How often the set of reporters is reconciled with the store
    pub reconcile_interval: Duration,

    /// How often a reporter checks whether a publish is due
    pub publish_check_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            livestate: LiveStateOptions::default(),
            reconcile_interval: Duration::from_secs(30),
            publish_check_interval: Duration::from_secs(10),
        }
    }
}

/// Collaborators shared by every per-application reporter task
#[derive(Clone)]
pub struct Deps {
    pub api: Arc<dyn ApiClient>,
    pub appstore: Arc<ApplicationStore>,
    pub providers: Arc<ProviderRegistry>,
    pub workspaces: Arc<GitWorkspaces>,
    pub trigger: Arc<DeploymentTrigger>,
}

/// Run the live-state worker
pub async fn run<S, F>(
    options: &Options,
    deps: Deps,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("live-state worker starting...");

    // At most one reconciler per application state.
    let mut reporters: HashMap<String, (CancelHandle, JoinHandle<()>)> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("live-state worker shutting down...");
                break;
            }
            _ = sleep_fn(options.reconcile_interval) => {}
        }

        reporters.retain(|id, (_, task)| {
            if task.is_finished() {
                debug!("live-state reporter for {} exited", id);
                false
            } else {
                true
            }
        });

        for app in deps.appstore.list() {
            let provider = deps.providers.get(&app.cloud_provider);
            let wanted = app.is_deployable()
                && provider
                    .as_ref()
                    .map(|p| p.supports_live_state())
                    .unwrap_or(false);

            match (wanted, reporters.contains_key(&app.id)) {
                (true, false) => {
                    let Some(provider) = provider else { continue };
                    info!("starting live-state reporter for {}", app.id);
                    let (handle, token) = CancelHandle::new();
                    let task = tokio::spawn(run_app(
                        app.clone(),
                        provider,
                        deps.clone(),
                        options.clone(),
                        token,
                    ));
                    reporters.insert(app.id.clone(), (handle, task));
                }
                (false, true) => {
                    info!("stopping live-state reporter for {}", app.id);
                    if let Some((handle, task)) = reporters.remove(&app.id) {
                        handle.cancel();
                        let _ = task.await;
                    }
                }
                _ => {}
            }
        }
    }

    for (_, (handle, task)) in reporters.drain() {
        handle.cancel();
        let _ = task.await;
    }
}

/// Drive one application's reporter until cancelled
async fn run_app(
    app: Application,
    provider: Arc<dyn PlatformProvider>,
    deps: Deps,
    options: Options,
    mut cancel: Cancellation,
) {
    let mut reporter = AppStateReporter::new(
        app.clone(),
        provider.clone(),
        deps.api,
        deps.workspaces,
        deps.trigger,
        options.livestate.clone(),
    );
    let mut events = provider.subscribe();

    let informer = {
        let provider = provider.clone();
        let app = app.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { provider.run_informer(app, cancel).await })
    };

    let mut resync_tick = tokio::time::interval(reporter.resync_interval());
    let mut publish_tick = tokio::time::interval(options.publish_check_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                match event {
                    Ok(event) => reporter.handle_event(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Coalescing dropped events; the next resync heals.
                        warn!("informer stream for {} lagged by {}", app.id, skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = resync_tick.tick() => {
                if let Err(e) = reporter.resync().await {
                    error!("live-state resync for {} failed: {}", app.id, e);
                }
            }
            _ = publish_tick.tick() => {
                if reporter.publish_due() {
                    if let Err(e) = reporter.evaluate_and_publish().await {
                        error!("live-state publish for {} failed: {}", app.id, e);
                    }
                }
            }
        }
    }

    informer.abort();
}
