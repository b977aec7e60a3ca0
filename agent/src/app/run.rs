//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::config::piped::PipedConfig;
use crate::errors::PipedError;
use crate::imagewatcher::{ImageWatcher, RegistryV2Client};
use crate::workers;

/// Run the piped agent until the shutdown signal resolves
pub async fn run(
    version: String,
    config: PipedConfig,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PipedError> {
    info!("initializing piped agent...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    match init(version, config, &options, shutdown_tx.clone(), &mut shutdown_manager).await {
        Ok(()) => {}
        Err(e) => {
            error!("failed to start agent: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    }

    tokio::select! {
        _ = shutdown_signal => {
            info!("shutdown signal received, shutting down...");
        }
    }

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    version: String,
    config: PipedConfig,
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PipedError> {
    let app_state = Arc::new(AppState::init(version, config, options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_stat_reporter(options, &app_state, shutdown_manager, shutdown_tx.subscribe());
    init_trigger_workers(options, &app_state, shutdown_manager, &shutdown_tx);
    init_controller_worker(options, &app_state, shutdown_manager, shutdown_tx.subscribe());
    init_commandstream_worker(options, &app_state, shutdown_manager, shutdown_tx.subscribe());
    init_livestate_worker(options, &app_state, shutdown_manager, shutdown_tx.subscribe());
    init_image_watchers(options, &app_state, shutdown_manager, &shutdown_tx)?;

    Ok(())
}

fn shutdown_future(
    mut rx: broadcast::Receiver<()>,
) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _ = rx.recv().await;
    })
}

fn init_stat_reporter(
    options: &AppOptions,
    app_state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) {
    info!("initializing stat reporter...");

    let worker_options = options.statreporter_worker.clone();
    let api = app_state.api.clone();
    let piped_id = app_state.config.piped_id.clone();
    let version = app_state.version.clone();
    let started_at = app_state.started_at;

    let handle = tokio::spawn(async move {
        workers::statreporter::run(
            &worker_options,
            api,
            piped_id,
            version,
            started_at,
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });
    shutdown_manager.add_worker("stat-reporter", handle);
}

fn init_trigger_workers(
    options: &AppOptions,
    app_state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) {
    for repo in &app_state.config.repositories {
        info!("initializing trigger worker for {}...", repo.repo_id);

        let worker_options = options.trigger_worker.clone();
        let trigger = app_state.trigger.clone();
        let repo_id = repo.repo_id.clone();
        let shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            workers::trigger::run(
                &worker_options,
                trigger,
                repo_id,
                tokio::time::sleep,
                shutdown_future(shutdown_rx),
            )
            .await;
        });
        shutdown_manager.add_worker("trigger", handle);
    }
}

fn init_controller_worker(
    options: &AppOptions,
    app_state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) {
    info!("initializing controller worker...");

    let worker_options = options.controller_worker.clone();
    let scheduler = app_state.scheduler.clone();

    let handle = tokio::spawn(async move {
        workers::controller::run(
            &worker_options,
            scheduler,
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });
    shutdown_manager.add_worker("controller", handle);
}

fn init_commandstream_worker(
    options: &AppOptions,
    app_state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) {
    info!("initializing command stream worker...");

    let worker_options = options.commandstream_worker.clone();
    let api = app_state.api.clone();
    let processor = app_state.commands.clone();

    let handle = tokio::spawn(async move {
        workers::commandstream::run(
            &worker_options,
            api,
            processor,
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });
    shutdown_manager.add_worker("command-stream", handle);
}

fn init_livestate_worker(
    options: &AppOptions,
    app_state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) {
    info!("initializing live-state worker...");

    let worker_options = options.livestate_worker.clone();
    let deps = workers::livestate::Deps {
        api: app_state.api.clone(),
        appstore: app_state.appstore.clone(),
        providers: app_state.providers.clone(),
        workspaces: app_state.workspaces.clone(),
        trigger: app_state.trigger.clone(),
    };

    let handle = tokio::spawn(async move {
        workers::livestate::run(
            &worker_options,
            deps,
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });
    shutdown_manager.add_worker("live-state", handle);
}

fn init_image_watchers(
    options: &AppOptions,
    app_state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), PipedError> {
    if app_state.config.image_providers.is_empty() {
        return Ok(());
    }

    let (events_tx, events_rx) = mpsc::channel(64);

    for provider in &app_state.config.image_providers {
        info!("initializing image watcher for {}...", provider.name);

        let registry = image_registry_client(provider)?;
        let watcher = Arc::new(ImageWatcher::new(
            &provider.name,
            registry,
            app_state.appstore.clone(),
            events_tx.clone(),
        ));
        let worker_options = workers::imagewatcher::Options {
            pull_interval: provider.pull_interval(),
        };
        let shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            workers::imagewatcher::run(
                &worker_options,
                watcher,
                tokio::time::sleep,
                shutdown_future(shutdown_rx),
            )
            .await;
        });
        shutdown_manager.add_worker("image-watcher", handle);
    }
    drop(events_tx);

    let trigger = app_state.trigger.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    let handle = tokio::spawn(async move {
        workers::trigger::run_image_events(trigger, events_rx, shutdown_future(shutdown_rx)).await;
    });
    shutdown_manager.add_worker("image-events", handle);

    Ok(())
}

fn image_registry_client(
    provider: &crate::config::piped::ImageProvider,
) -> Result<Arc<dyn crate::imagewatcher::ImageRegistryClient>, PipedError> {
    use crate::config::piped::ImageProviderSpec;

    let base_url = match &provider.spec {
        ImageProviderSpec::Dockerhub(_) => "https://registry-1.docker.io".to_string(),
        ImageProviderSpec::Gcr(gcr) => {
            let domain = if gcr.domain.is_empty() {
                "gcr.io"
            } else {
                &gcr.domain
            };
            format!("https://{}", domain)
        }
        ImageProviderSpec::Ecr(ecr) => format!("https://public.ecr.aws/{}", ecr.region),
    };
    Ok(Arc::new(RegistryV2Client::new(&base_url)?))
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            workers: Vec::new(),
        }
    }

    fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), PipedError> {
        if self.app_state.is_some() {
            return Err(PipedError::Shutdown("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    fn add_worker(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.workers.push((name, handle));
    }

    async fn shutdown(&mut self) -> Result<(), PipedError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PipedError> {
        info!("shutting down piped agent...");

        // 1. Worker loops stop producing work.
        for (name, handle) in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!("{} worker did not stop cleanly: {}", name, e);
            }
        }

        // 2. In-flight deployment drivers are interrupted and the progress
        //    queues released; unreported events may be lost, which
        //    at-least-once delivery tolerates.
        if let Some(state) = self.app_state.take() {
            state.shutdown().await;
        }

        info!("shutdown complete");
        Ok(())
    }
}
