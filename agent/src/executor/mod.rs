//! Stage executors.
//!
//! Each stage kind maps to one executor through the registry; the controller
//! invokes `execute` with an [`Input`] bundle and reacts to the returned
//! outcome. Executors never talk to the API directly; progress flows through
//! the log sink and the returned outcome.

pub mod analysis;
pub mod approval;
pub mod registry;
pub mod rollback;
pub mod sync;
pub mod terraform;
pub mod wait;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::cancel::Cancellation;
use crate::config::app::ApplicationConfig;
use crate::model::application::Application;
use crate::model::deployment::{Deployment, Stage};
use crate::providers::PlatformProvider;
use crate::reporter::StageLogSink;
use crate::toolregistry::ToolRegistry;

pub use registry::ExecutorRegistry;

/// What a stage execution produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,

    Failure {
        reason: String,
        /// Whether the controller may retry within the stage's retry limit
        retryable: bool,
    },

    Cancelled,

    /// The stage chose not to run; successors treat this as satisfied
    Skipped,
}

impl ExecutionOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn retryable_failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
            retryable: true,
        }
    }
}

/// Everything an executor gets to work with
#[derive(Clone)]
pub struct Input {
    /// Snapshot of the deployment this stage belongs to
    pub deployment: Deployment,

    /// The stage being executed
    pub stage: Stage,

    /// The application under deployment
    pub application: Application,

    /// Parsed application config at the trigger commit
    pub app_config: ApplicationConfig,

    /// Checkout of the commit currently running, when known
    pub running_workspace: Option<PathBuf>,

    /// Checkout of the commit being deployed
    pub target_workspace: PathBuf,

    /// Cancellation signal; must reach any child process
    pub cancel: Cancellation,

    /// Sink for stage log lines
    pub logs: StageLogSink,

    /// Approval notifications for this deployment
    pub approvals: Arc<ApprovalGate>,

    pub tools: Arc<ToolRegistry>,

    /// Provider selected by the application config, when registered
    pub provider: Option<Arc<dyn PlatformProvider>>,
}

impl Input {
    /// Path of the application directory inside the target checkout
    pub fn target_app_dir(&self) -> PathBuf {
        self.target_workspace.join(&self.deployment.app_path)
    }

    /// Path of the application directory inside the running checkout
    pub fn running_app_dir(&self) -> Option<PathBuf> {
        self.running_workspace
            .as_ref()
            .map(|ws| ws.join(&self.deployment.app_path))
    }
}

/// A single stage execution capability
#[async_trait]
pub trait StageExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, input: Input) -> ExecutionOutcome;
}

/// Factory producing the executor for one stage kind
pub type ExecutorFactory = Arc<dyn Fn() -> Arc<dyn StageExecutor> + Send + Sync>;

/// Tracks APPROVE_STAGE commands per deployment.
///
/// Approvals are recorded by stage index; an executor waiting on an index
/// wakes as soon as that index is approved, regardless of arrival order.
pub struct ApprovalGate {
    approved: watch::Sender<HashSet<u32>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        let (approved, _) = watch::channel(HashSet::new());
        Self { approved }
    }

    pub fn approve(&self, stage_index: u32) {
        self.approved.send_modify(|set| {
            set.insert(stage_index);
        });
    }

    pub fn is_approved(&self, stage_index: u32) -> bool {
        self.approved.borrow().contains(&stage_index)
    }

    /// Resolves once the stage has been approved
    pub async fn wait_for(&self, stage_index: u32) {
        let mut rx = self.approved.subscribe();
        // The sender lives as long as the gate, so this cannot error.
        let _ = rx.wait_for(|set| set.contains(&stage_index)).await;
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}
