//! Application state assembly

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::api::client::ApiClient;
use crate::api::http::HttpApiClient;
use crate::app::options::AppOptions;
use crate::appstore::ApplicationStore;
use crate::commandstream::CommandProcessor;
use crate::config::piped::{CloudProviderSpec, PipedConfig};
use crate::controller::Scheduler;
use crate::crypto;
use crate::errors::PipedError;
use crate::executor::analysis::{AnalysisExecutor, NoopEvaluator};
use crate::executor::approval::WaitApprovalExecutor;
use crate::executor::rollback::RollbackExecutor;
use crate::executor::sync::SyncExecutor;
use crate::executor::terraform::TerraformExecutor;
use crate::executor::wait::WaitExecutor;
use crate::executor::{ExecutorRegistry, StageExecutor};
use crate::filesys::file::File;
use crate::git::{GitClient, GitWorkspaces};
use crate::model::deployment::StageKind;
use crate::providers::kubernetes::KubernetesProvider;
use crate::providers::ProviderRegistry;
use crate::reporter::ProgressReporter;
use crate::storage::layout::StorageLayout;
use crate::toolregistry::{HttpToolInstaller, ToolRegistry};
use crate::trigger::DeploymentTrigger;

const HELM_VERSION: &str = "3.4.2";

/// Main application state
pub struct AppState {
    pub config: PipedConfig,
    pub layout: StorageLayout,
    pub api: Arc<dyn ApiClient>,
    pub appstore: Arc<ApplicationStore>,
    pub workspaces: Arc<GitWorkspaces>,
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub executors: Arc<ExecutorRegistry>,
    pub reporter: Arc<ProgressReporter>,
    pub trigger: Arc<DeploymentTrigger>,
    pub scheduler: Arc<Scheduler>,
    pub commands: Arc<CommandProcessor>,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

impl AppState {
    /// Initialize application state from a validated configuration
    pub async fn init(
        version: String,
        config: PipedConfig,
        options: &AppOptions,
    ) -> Result<Self, PipedError> {
        info!("initializing application state...");

        let layout = match &config.base_dir {
            Some(base_dir) => StorageLayout::new(base_dir.clone()),
            None => StorageLayout::default(),
        };
        layout.setup().await?;

        let piped_key = File::new(config.piped_key_file.clone())
            .read_string()
            .await
            .map_err(|e| {
                PipedError::Config(format!(
                    "cannot read piped key file {}: {}",
                    config.piped_key_file.display(),
                    e
                ))
            })?;

        let api: Arc<dyn ApiClient> = Arc::new(HttpApiClient::new(
            &config.api_address,
            &config.project_id,
            &config.piped_id,
            &piped_key,
        )?);

        if config.git.should_configure_ssh() {
            write_ssh_config(&config, &layout).await?;
        }

        let git_client = GitClient::new(
            &config.git.username,
            &config.git.email,
            config.git.ssh_key_file.as_deref(),
        );
        let workspaces = Arc::new(GitWorkspaces::new(
            layout.clone(),
            git_client,
            &config.repositories,
            options.workspace.clone(),
        ));

        let installer = Arc::new(HttpToolInstaller::new()?);
        let tools = Arc::new(ToolRegistry::new(layout.tools_dir().path(), installer));

        add_chart_repositories(&config, &tools).await;

        let decrypter = crypto::decrypter_for(config.sealed_secret_management.as_ref())?;

        let mut providers = ProviderRegistry::new();
        for provider in &config.cloud_providers {
            match &provider.spec {
                CloudProviderSpec::Kubernetes(k8s) => {
                    providers.register(Arc::new(KubernetesProvider::new(
                        &provider.name,
                        k8s.clone(),
                        tools.clone(),
                        decrypter.clone(),
                    )));
                }
                other => {
                    // Only the kubernetes provider ships introspection in
                    // this build; terraform apps deploy through the
                    // terraform stages instead.
                    warn!(
                        "cloud provider {} ({:?}) has no platform client in this build",
                        provider.name,
                        other.kind()
                    );
                }
            }
        }
        let providers = Arc::new(providers);

        let executors = Arc::new(build_executor_registry()?);

        let appstore = Arc::new(ApplicationStore::new(&config.project_id));
        let reporter = Arc::new(ProgressReporter::new(api.clone(), options.reporter.clone()));
        let trigger = Arc::new(
            DeploymentTrigger::load(
                api.clone(),
                workspaces.clone(),
                appstore.clone(),
                layout.trigger_state_file(),
            )
            .await,
        );

        let scheduler = Arc::new(Scheduler::new(
            api.clone(),
            executors.clone(),
            workspaces.clone(),
            reporter.clone(),
            tools.clone(),
            providers.clone(),
            appstore.clone(),
            options.controller.clone(),
        ));

        let commands = Arc::new(CommandProcessor::new(
            api.clone(),
            scheduler.clone(),
            trigger.clone(),
        ));

        Ok(Self {
            config,
            layout,
            api,
            appstore,
            workspaces,
            tools,
            providers,
            executors,
            reporter,
            trigger,
            scheduler,
            commands,
            started_at: Utc::now(),
            version,
        })
    }

    /// Stop everything that outlives the worker loops
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.reporter.shutdown().await;
    }
}

/// Bind every stage kind to its executor. Registration happens exactly once
/// here; a duplicate binding is a wiring bug surfaced at startup.
fn build_executor_registry() -> Result<ExecutorRegistry, PipedError> {
    let registry = ExecutorRegistry::new();
    registry.register(
        StageKind::Wait,
        Arc::new(|| Arc::new(WaitExecutor) as Arc<dyn StageExecutor>),
    )?;
    registry.register(
        StageKind::WaitApproval,
        Arc::new(|| Arc::new(WaitApprovalExecutor) as Arc<dyn StageExecutor>),
    )?;
    registry.register(
        StageKind::Analysis,
        Arc::new(|| {
            Arc::new(AnalysisExecutor::new(Arc::new(NoopEvaluator))) as Arc<dyn StageExecutor>
        }),
    )?;
    registry.register(
        StageKind::Sync,
        Arc::new(|| Arc::new(SyncExecutor) as Arc<dyn StageExecutor>),
    )?;
    registry.register(
        StageKind::TerraformPlan,
        Arc::new(|| Arc::new(TerraformExecutor::plan()) as Arc<dyn StageExecutor>),
    )?;
    registry.register(
        StageKind::TerraformApply,
        Arc::new(|| Arc::new(TerraformExecutor::apply()) as Arc<dyn StageExecutor>),
    )?;
    registry.register(
        StageKind::Rollback,
        Arc::new(|| Arc::new(RollbackExecutor) as Arc<dyn StageExecutor>),
    )?;
    Ok(registry)
}

/// Register the configured helm chart repositories. Best-effort: a chart
/// repository that cannot be added only disables the charts it serves.
async fn add_chart_repositories(config: &PipedConfig, tools: &Arc<ToolRegistry>) {
    if config.chart_repositories.is_empty() {
        return;
    }

    let helm = match tools.resolve("helm", HELM_VERSION).await {
        Ok(path) => path,
        Err(e) => {
            warn!("helm unavailable, skipping chart repositories: {}", e);
            return;
        }
    };

    for repo in &config.chart_repositories {
        let mut cmd = tokio::process::Command::new(&helm);
        cmd.args(["repo", "add", &repo.name, &repo.address]);
        if !repo.username.is_empty() {
            cmd.args(["--username", &repo.username]);
        }
        if !repo.password.is_empty() {
            cmd.args(["--password", &repo.password]);
        }
        match cmd.output().await {
            Ok(output) if output.status.success() => {
                info!("added chart repository {}", repo.name);
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("adding chart repository {} failed: {}", repo.name, stderr.trim());
            }
            Err(e) => warn!("adding chart repository {} failed: {}", repo.name, e),
        }
    }
}

/// Materialize the ssh configuration used by git when a key is configured
async fn write_ssh_config(config: &PipedConfig, layout: &StorageLayout) -> Result<(), PipedError> {
    let Some(key_file) = &config.git.ssh_key_file else {
        return Ok(());
    };

    let ssh_config = match &config.git.ssh_config_file_path {
        Some(path) => File::new(path.clone()),
        None => layout.ssh_config_file(),
    };

    let contents = format!(
        "Host {host}\n  HostName {host}\n  User git\n  IdentityFile {key}\n  StrictHostKeyChecking no\n",
        host = config.git.host,
        key = key_file.display(),
    );
    ssh_config.write_string(&contents).await?;
    ssh_config.set_permissions_600().await?;
    info!("wrote ssh config to {}", ssh_config.path().display());
    Ok(())
}
