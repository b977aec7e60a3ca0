//! Deployment controller.
//!
//! The scheduler tracks every non-terminal deployment the API hands down and
//! runs one driver task per deployment to terminal status. Per application,
//! only one driver runs at a time: the API guarantees at most one
//! non-terminal deployment per application, and a local per-application
//! mutex additionally serialises drivers across reclaim races.

pub mod driver;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::client::ApiClient;
use crate::appstore::ApplicationStore;
use crate::cancel::CancelHandle;
use crate::errors::PipedError;
use crate::executor::{ApprovalGate, ExecutorRegistry};
use crate::git::GitWorkspaces;
use crate::model::deployment::Deployment;
use crate::providers::ProviderRegistry;
use crate::reporter::ProgressReporter;
use crate::toolregistry::ToolRegistry;
use crate::utils::CooldownOptions;

/// Controller options
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Bound on stage executions running in parallel across the agent
    pub max_concurrent_stages: usize,

    /// How long a cancelled executor gets to surface the signal before the
    /// controller reports CANCELLED regardless
    pub executor_cancel_window: Duration,

    /// Delay between retries of a retryable stage failure
    pub retry_delay: Duration,

    /// Attempts for persisting a plan before giving up for this round
    pub api_retry_attempts: u32,

    /// Backoff between failed API persistence attempts
    pub api_cooldown: CooldownOptions,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 8,
            executor_cancel_window: Duration::from_secs(30),
            retry_delay: Duration::from_secs(15),
            api_retry_attempts: 5,
            api_cooldown: CooldownOptions::default(),
        }
    }
}

/// Shared dependencies handed to every driver
#[derive(Clone)]
pub struct DriverContext {
    pub api: Arc<dyn ApiClient>,
    pub registry: Arc<ExecutorRegistry>,
    pub workspaces: Arc<GitWorkspaces>,
    pub reporter: Arc<ProgressReporter>,
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub appstore: Arc<ApplicationStore>,
    pub options: ControllerOptions,
    pub slots: Arc<Semaphore>,
}

/// Control surface of one in-flight deployment
struct DeploymentHandle {
    cancel: CancelHandle,
    approvals: Arc<ApprovalGate>,
    chain_update: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Runs deployment drivers and routes commands to them
pub struct Scheduler {
    ctx: DriverContext,
    running: Mutex<HashMap<String, DeploymentHandle>>,
    app_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ApiClient>,
        registry: Arc<ExecutorRegistry>,
        workspaces: Arc<GitWorkspaces>,
        reporter: Arc<ProgressReporter>,
        tools: Arc<ToolRegistry>,
        providers: Arc<ProviderRegistry>,
        appstore: Arc<ApplicationStore>,
        options: ControllerOptions,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(options.max_concurrent_stages));
        Self {
            ctx: DriverContext {
                api,
                registry,
                workspaces,
                reporter,
                tools,
                providers,
                appstore,
                options,
                slots,
            },
            running: Mutex::new(HashMap::new()),
            app_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Pull not-completed deployments and ensure a driver runs for each.
    /// Also used at startup to reclaim deployments assigned to this piped
    /// by a previous run.
    pub async fn tick(&self) -> Result<usize, PipedError> {
        self.prune_finished().await;

        let deployments = self.ctx.api.list_not_completed_deployments().await?;
        let mut started = 0;
        for deployment in deployments {
            if self.ensure_running(deployment).await {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Spawn a driver for the deployment unless one is already running.
    /// Returns whether a new driver was started.
    pub async fn ensure_running(&self, deployment: Deployment) -> bool {
        if deployment.status.is_terminal() {
            return false;
        }

        let mut running = self.running.lock().await;
        if running.contains_key(&deployment.id) {
            return false;
        }

        info!(
            "starting driver for deployment {} (application {})",
            deployment.id, deployment.application_id
        );

        let (cancel, token) = CancelHandle::new();
        let approvals = Arc::new(ApprovalGate::new());
        let chain_update = Arc::new(AtomicBool::new(false));
        let app_lock = self.app_lock(&deployment.application_id).await;

        let ctx = self.ctx.clone();
        let deployment_id = deployment.id.clone();
        let task_approvals = approvals.clone();
        let task_chain_update = chain_update.clone();
        let task = tokio::spawn(async move {
            // Defence in depth: even if the API ever hands down two
            // non-terminal deployments for one application, their drivers
            // serialise here.
            let _guard = app_lock.lock().await;
            driver::run(ctx, deployment, token, task_approvals, task_chain_update).await;
        });

        running.insert(
            deployment_id,
            DeploymentHandle {
                cancel,
                approvals,
                chain_update,
                task,
            },
        );
        true
    }

    /// Propagate a CANCEL_DEPLOYMENT command; false when unknown
    pub async fn cancel(&self, deployment_id: &str) -> bool {
        let running = self.running.lock().await;
        match running.get(deployment_id) {
            Some(handle) => {
                info!("cancelling deployment {}", deployment_id);
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Record an APPROVE_STAGE command; false when unknown
    pub async fn approve(&self, deployment_id: &str, stage_index: u32) -> bool {
        let running = self.running.lock().await;
        match running.get(deployment_id) {
            Some(handle) => {
                info!("approving stage {} of {}", stage_index, deployment_id);
                handle.approvals.approve(stage_index);
                true
            }
            None => false,
        }
    }

    /// Flag a CHAIN_UPDATE command; picked up at the next stage boundary
    pub async fn request_chain_update(&self, deployment_id: &str) -> bool {
        let running = self.running.lock().await;
        match running.get(deployment_id) {
            Some(handle) => {
                handle.chain_update.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Number of drivers currently running
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Interrupt every driver without cancelling its deployment: the
    /// deployments stay non-terminal in the API and are reclaimed from
    /// their persisted plans on the next start. A cancel here would wrongly
    /// publish CANCELLED for work that merely got interrupted.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, DeploymentHandle)> = {
            let mut running = self.running.lock().await;
            running.drain().collect()
        };
        for (id, handle) in handles {
            info!("interrupting driver for {}", id);
            handle.task.abort();
            if let Err(e) = handle.task.await {
                if !e.is_cancelled() {
                    warn!("driver for {} did not shut down cleanly: {}", id, e);
                }
            }
        }
    }

    async fn prune_finished(&self) {
        let mut running = self.running.lock().await;
        running.retain(|_, handle| !handle.task.is_finished());
    }

    async fn app_lock(&self, application_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.app_locks.lock().await;
        locks
            .entry(application_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
