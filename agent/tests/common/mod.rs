//! Shared test support: an in-memory control plane, configurable fake
//! executors, and git repository fixtures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use piped::api::client::{
    ApiClient, CreateDeploymentRequest, LogBlock, PipedStat,
};
use piped::appstore::ApplicationStore;
use piped::controller::{ControllerOptions, Scheduler};
use piped::errors::PipedError;
use piped::executor::{
    ExecutionOutcome, ExecutorFactory, ExecutorRegistry, Input, StageExecutor,
};
use piped::git::{GitClient, GitWorkspaces, WorkspaceOptions};
use piped::model::application::{Application, ApplicationKind, ApplicationSyncState};
use piped::model::command::{Command as PipedCommand, CommandResult};
use piped::model::deployment::{
    Deployment, DeploymentStatus, DeploymentTrigger, Stage, StageStatus, TriggerSource,
};
use piped::model::livestate::ApplicationLiveState;
use piped::providers::ProviderRegistry;
use piped::reporter::{ProgressReporter, ReporterOptions};
use piped::storage::layout::StorageLayout;
use piped::toolregistry::{ToolInstaller, ToolRegistry};
use piped::utils::CooldownOptions;

// ================================ fake API ================================== //

#[derive(Default)]
pub struct FakeApiClient {
    pub deployments: Mutex<Vec<Deployment>>,
    pub planned: Mutex<Vec<(String, Vec<Stage>)>>,
    pub stage_events: Mutex<Vec<(String, u32, StageStatus, String, u32)>>,
    pub status_events: Mutex<Vec<(String, DeploymentStatus, String)>>,
    pub logs: Mutex<Vec<(String, u32, LogBlock)>>,
    pub seqs: Mutex<HashMap<String, Vec<u64>>>,
    pub created: Mutex<Vec<CreateDeploymentRequest>>,
    pub handled_commands: Mutex<Vec<(String, CommandResult)>>,
    pub sync_states: Mutex<Vec<(String, ApplicationSyncState)>>,
    pub live_states: Mutex<Vec<ApplicationLiveState>>,
    /// Number of report calls that fail before the API "recovers"
    pub failing_reports: AtomicU32,
    next_id: AtomicU32,
}

impl FakeApiClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_deployment(&self, deployment: Deployment) {
        self.deployments.lock().unwrap().push(deployment);
    }

    pub fn deployment_status(&self, id: &str) -> Option<DeploymentStatus> {
        self.deployments
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.status)
    }

    /// Drive every stored deployment to a terminal status
    pub fn complete_all(&self) {
        for deployment in self.deployments.lock().unwrap().iter_mut() {
            deployment.status = DeploymentStatus::Success;
        }
    }

    pub fn stage_status(&self, deployment_id: &str, index: u32) -> Option<StageStatus> {
        self.stage_events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, i, ..)| id == deployment_id && *i == index)
            .map(|(_, _, status, _, _)| *status)
    }

    pub fn stage_retried_count(&self, deployment_id: &str, index: u32) -> Option<u32> {
        self.stage_events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, i, ..)| id == deployment_id && *i == index)
            .map(|(.., retried)| *retried)
    }

    fn record_seq(&self, deployment_id: &str, seq: u64) {
        self.seqs
            .lock()
            .unwrap()
            .entry(deployment_id.to_string())
            .or_default()
            .push(seq);
    }

    fn maybe_fail(&self) -> Result<(), PipedError> {
        if self
            .failing_reports
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipedError::Api("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    async fn ping(&self, _stat: PipedStat) -> Result<(), PipedError> {
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, PipedError> {
        Ok(Vec::new())
    }

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: ApplicationSyncState,
    ) -> Result<(), PipedError> {
        self.sync_states
            .lock()
            .unwrap()
            .push((application_id.to_string(), state));
        Ok(())
    }

    async fn report_application_live_state(
        &self,
        state: ApplicationLiveState,
    ) -> Result<(), PipedError> {
        self.live_states.lock().unwrap().push(state);
        Ok(())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .iter()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn report_deployment_planned(
        &self,
        deployment_id: &str,
        stages: Vec<Stage>,
        _status_reason: &str,
    ) -> Result<(), PipedError> {
        self.maybe_fail()?;
        let mut deployments = self.deployments.lock().unwrap();
        if let Some(deployment) = deployments.iter_mut().find(|d| d.id == deployment_id) {
            deployment.stages = stages.clone();
        }
        self.planned
            .lock()
            .unwrap()
            .push((deployment_id.to_string(), stages));
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        status_reason: &str,
        seq: u64,
    ) -> Result<(), PipedError> {
        self.maybe_fail()?;
        self.record_seq(deployment_id, seq);
        let mut deployments = self.deployments.lock().unwrap();
        if let Some(deployment) = deployments.iter_mut().find(|d| d.id == deployment_id) {
            deployment.status = status;
            deployment.status_reason = status_reason.to_string();
        }
        self.status_events.lock().unwrap().push((
            deployment_id.to_string(),
            status,
            status_reason.to_string(),
        ));
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_index: u32,
        status: StageStatus,
        status_reason: &str,
        retried_count: u32,
        seq: u64,
    ) -> Result<(), PipedError> {
        self.maybe_fail()?;
        self.record_seq(deployment_id, seq);
        let mut deployments = self.deployments.lock().unwrap();
        if let Some(deployment) = deployments.iter_mut().find(|d| d.id == deployment_id) {
            if let Some(stage) = deployment
                .stages
                .iter_mut()
                .find(|s| s.index == stage_index)
            {
                stage.status = status;
                stage.status_reason = status_reason.to_string();
                stage.retried_count = retried_count;
            }
        }
        self.stage_events.lock().unwrap().push((
            deployment_id.to_string(),
            stage_index,
            status,
            status_reason.to_string(),
            retried_count,
        ));
        Ok(())
    }

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_index: u32,
        blocks: Vec<LogBlock>,
    ) -> Result<(), PipedError> {
        self.maybe_fail()?;
        for block in blocks {
            self.record_seq(deployment_id, block.index);
            self.logs
                .lock()
                .unwrap()
                .push((deployment_id.to_string(), stage_index, block));
        }
        Ok(())
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<PipedCommand>, PipedError> {
        Ok(Vec::new())
    }

    async fn report_command_handled(
        &self,
        command_id: &str,
        result: CommandResult,
        _output: Vec<u8>,
    ) -> Result<(), PipedError> {
        self.handled_commands
            .lock()
            .unwrap()
            .push((command_id.to_string(), result));
        Ok(())
    }

    async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
    ) -> Result<String, PipedError> {
        let id = format!("dep-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(request.clone());
        let deployment = Deployment {
            id: id.clone(),
            application_id: request.application_id,
            project_id: "demo".to_string(),
            piped_id: "piped-1".to_string(),
            repo_id: request.repo_id,
            app_path: request.app_path,
            kind: request.kind,
            trigger: request.trigger,
            stages: Vec::new(),
            status: DeploymentStatus::Pending,
            status_reason: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.deployments.lock().unwrap().push(deployment);
        Ok(id)
    }
}

// ============================== fake executors ============================== //

#[derive(Debug)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Retryable failure for the first N attempts, then success
    FlakyThenSucceed(u32),
    /// Park until cancelled
    Block,
    SleepThenSucceed(Duration),
}

#[derive(Debug)]
pub struct FakeExecutor {
    behavior: Behavior,
    pub executions: AtomicU32,
}

impl FakeExecutor {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            executions: AtomicU32::new(0),
        })
    }

    pub fn factory(self: &Arc<Self>) -> ExecutorFactory {
        let executor = self.clone();
        Arc::new(move || executor.clone() as Arc<dyn StageExecutor>)
    }
}

#[async_trait]
impl StageExecutor for FakeExecutor {
    async fn execute(&self, input: Input) -> ExecutionOutcome {
        let attempt = self.executions.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => ExecutionOutcome::Success,
            Behavior::Fail(reason) => ExecutionOutcome::failure(*reason),
            Behavior::FlakyThenSucceed(failures) => {
                if attempt < *failures {
                    ExecutionOutcome::retryable_failure("flaky")
                } else {
                    ExecutionOutcome::Success
                }
            }
            Behavior::Block => {
                let mut cancel = input.cancel.clone();
                cancel.cancelled().await;
                ExecutionOutcome::Cancelled
            }
            Behavior::SleepThenSucceed(duration) => {
                let mut cancel = input.cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => ExecutionOutcome::Success,
                    _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
                }
            }
        }
    }
}

// =============================== git fixtures =============================== //

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("git must be runnable in tests");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create an origin repository with `app/.piped.yaml` and return its head
pub fn init_origin(dir: &Path, app_config_yaml: &str) -> String {
    std::fs::create_dir_all(dir.join("app")).unwrap();
    git(dir, &["init"]);
    // Pin the branch name regardless of the host git's default.
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(dir.join("app/.piped.yaml"), app_config_yaml).unwrap();
    std::fs::write(dir.join("app/manifest.yaml"), "kind: ConfigMap\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "initial"]);
    head(dir)
}

/// Commit a change under the app directory and return the new head
pub fn commit_change(dir: &Path, file: &str, contents: &str) -> String {
    std::fs::write(dir.join(file), contents).unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "change"]);
    head(dir)
}

pub fn head(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .expect("git must be runnable in tests");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

// ============================== environment ================================= //

struct NoInstaller;

#[async_trait]
impl ToolInstaller for NoInstaller {
    async fn install(&self, tool: &str, _version: &str, _dest: &Path) -> Result<(), String> {
        Err(format!("{} is not installable in tests", tool))
    }
}

/// Everything a controller scenario needs, wired against one origin repo
pub struct TestEnv {
    pub root: tempfile::TempDir,
    pub api: Arc<FakeApiClient>,
    pub workspaces: Arc<GitWorkspaces>,
    pub appstore: Arc<ApplicationStore>,
    pub registry: Arc<ExecutorRegistry>,
    pub head: String,
}

impl TestEnv {
    /// Build an environment whose origin declares the given app config
    pub fn new(app_config_yaml: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let origin = root.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        let head = init_origin(&origin, app_config_yaml);

        let layout = StorageLayout::new(root.path().join("piped"));
        let client = GitClient::new("test", "test@example.com", None);
        let repositories = vec![piped::config::piped::Repository {
            repo_id: "main".to_string(),
            remote: origin.to_string_lossy().into_owned(),
            branch: "main".to_string(),
        }];
        let workspaces = Arc::new(GitWorkspaces::new(
            layout,
            client,
            &repositories,
            WorkspaceOptions::default(),
        ));

        Self {
            root,
            api: FakeApiClient::new(),
            workspaces,
            appstore: Arc::new(ApplicationStore::new("demo")),
            registry: Arc::new(ExecutorRegistry::new()),
            head,
        }
    }

    pub fn origin(&self) -> std::path::PathBuf {
        self.root.path().join("origin")
    }

    /// Fast-feedback controller options for tests
    pub fn controller_options() -> ControllerOptions {
        ControllerOptions {
            max_concurrent_stages: 4,
            executor_cancel_window: Duration::from_millis(500),
            retry_delay: Duration::from_millis(20),
            api_retry_attempts: 3,
            api_cooldown: CooldownOptions {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
            },
        }
    }

    pub fn reporter_options() -> ReporterOptions {
        ReporterOptions {
            queue_capacity: 64,
            max_batch: 16,
            flush_interval: Duration::from_millis(25),
            cooldown: CooldownOptions {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
            },
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        let tools = Arc::new(ToolRegistry::new(
            self.root.path().join("tools"),
            Arc::new(NoInstaller),
        ));
        let reporter = Arc::new(ProgressReporter::new(
            self.api.clone(),
            Self::reporter_options(),
        ));
        Arc::new(Scheduler::new(
            self.api.clone(),
            self.registry.clone(),
            self.workspaces.clone(),
            reporter,
            tools,
            Arc::new(ProviderRegistry::new()),
            self.appstore.clone(),
            Self::controller_options(),
        ))
    }

    /// A pending deployment targeting the current head
    pub fn deployment(&self, id: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            application_id: "app-1".to_string(),
            project_id: "demo".to_string(),
            piped_id: "piped-1".to_string(),
            repo_id: "main".to_string(),
            app_path: "app".to_string(),
            kind: ApplicationKind::Kubernetes,
            trigger: DeploymentTrigger {
                commit_from: None,
                commit_to: self.head.clone(),
                source: TriggerSource::Scheduled,
                commander: None,
                timestamp: Utc::now(),
            },
            stages: Vec::new(),
            status: DeploymentStatus::Pending,
            status_reason: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Poll until the deployment reaches a terminal status
pub async fn wait_terminal(api: &FakeApiClient, id: &str) -> DeploymentStatus {
    for _ in 0..400 {
        if let Some(status) = api.deployment_status(id) {
            if status.is_terminal() {
                // Give the reporter a beat to flush trailing events.
                tokio::time::sleep(Duration::from_millis(100)).await;
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {} never reached a terminal status", id);
}

/// Poll until a stage has been observed in the given status
pub async fn wait_stage(api: &FakeApiClient, id: &str, index: u32, status: StageStatus) {
    for _ in 0..400 {
        if api.stage_status(id, index) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("stage {}:{} never reached {:?}", id, index, status);
}
