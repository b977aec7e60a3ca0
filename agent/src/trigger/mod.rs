//! Deployment trigger.
//!
//! Per-repo change detection: compares the head commit against the
//! last-triggered commit per application and asks the API to create
//! deployments for the ones that changed. Image-update events, sync
//! commands and live-state drift feed the same creation path with their
//! own trigger sources.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::client::{ApiClient, CreateDeploymentRequest};
use crate::appstore::{self, ApplicationStore};
use crate::errors::PipedError;
use crate::filesys::file::File;
use crate::git::GitWorkspaces;
use crate::model::application::Application;
use crate::model::deployment::{DeploymentTrigger as Trigger, TriggerSource};
use crate::model::event::ImageUpdateEvent;
use crate::utils::sha256_hash;

use crate::config::app::APPLICATION_CONFIG_FILENAME;

/// Watches repositories and creates deployments for changed applications
pub struct DeploymentTrigger {
    api: Arc<dyn ApiClient>,
    workspaces: Arc<GitWorkspaces>,
    appstore: Arc<ApplicationStore>,
    state_file: File,
    /// Last commit a deployment was created for, per application id.
    /// Persisted only after the API acknowledged the deployment.
    last_triggered: Mutex<HashMap<String, String>>,
}

impl DeploymentTrigger {
    /// Build a trigger, restoring per-application state from disk
    pub async fn load(
        api: Arc<dyn ApiClient>,
        workspaces: Arc<GitWorkspaces>,
        appstore: Arc<ApplicationStore>,
        state_file: File,
    ) -> Self {
        let last_triggered = if state_file.exists().await {
            match state_file.read_json::<HashMap<String, String>>().await {
                Ok(state) => state,
                Err(e) => {
                    warn!("trigger state unreadable, starting fresh: {}", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Self {
            api,
            workspaces,
            appstore,
            state_file,
            last_triggered: Mutex::new(last_triggered),
        }
    }

    /// One polling round for one repository: refresh the mirror, rebuild the
    /// application set, and create deployments for changed applications in
    /// application-id order.
    pub async fn tick_repo(&self, repo_id: &str) -> Result<usize, PipedError> {
        let head = self.workspaces.clone_or_fetch(repo_id).await?;
        debug!("{} is at {}", repo_id, head);

        // Rediscover applications from the fresh head.
        let ws = self.workspaces.checkout(repo_id, &head).await?;
        let scanned = appstore::scan_checkout(&ws.path).await;
        self.workspaces.release(ws).await;
        self.appstore.sync_repo(repo_id, scanned?);

        let suppressed = self.active_applications().await?;

        let mut apps = self.appstore.list_by_repo(repo_id);
        apps.sort_by(|a, b| a.id.cmp(&b.id));

        let mut created = 0;
        for app in apps {
            if !app.is_deployable() {
                continue;
            }
            if suppressed.contains(&app.id) {
                // The running deployment re-plans via chain-update if it
                // supports it; otherwise the change lands on completion.
                debug!("suppressing trigger for {}: deployment in flight", app.id);
                continue;
            }

            let last = {
                let state = self.last_triggered.lock().await;
                state.get(&app.id).cloned()
            };

            let changed = match &last {
                None => true,
                Some(last) => self.has_changes(&app, last, &head).await?,
            };
            if !changed {
                continue;
            }

            self.create_deployment(&app, last, &head, TriggerSource::Scheduled, None)
                .await?;
            created += 1;
        }

        Ok(created)
    }

    /// Whether the application changed between two commits: its config file
    /// content, or anything under its path or watched path prefixes.
    async fn has_changes(
        &self,
        app: &Application,
        from: &str,
        to: &str,
    ) -> Result<bool, PipedError> {
        if from == to {
            return Ok(false);
        }

        let mirror = self.workspaces.mirror_path(&app.repo_id).await?;
        let client = self.workspaces.client();

        let config_path = if app.path.is_empty() {
            APPLICATION_CONFIG_FILENAME.to_string()
        } else {
            format!("{}/{}", app.path, APPLICATION_CONFIG_FILENAME)
        };
        let old = client.cat_file(&mirror, from, &config_path).await?;
        let new = client.cat_file(&mirror, to, &config_path).await?;
        let old_digest = old.as_deref().map(sha256_hash);
        let new_digest = new.as_deref().map(sha256_hash);
        if old_digest != new_digest {
            return Ok(true);
        }

        let mut prefixes: Vec<String> = vec![app.path.clone()];
        if let Some(config) = &app.config {
            prefixes.extend(config.trigger.paths.iter().cloned());
        }

        let changed = client.changed_files(&mirror, from, to).await?;
        Ok(changed
            .iter()
            .any(|file| prefixes.iter().any(|prefix| file.starts_with(prefix.as_str()))))
    }

    /// Create a deployment via a SYNC_APPLICATION command
    pub async fn trigger_sync(
        &self,
        application_id: &str,
        commander: &str,
    ) -> Result<(), PipedError> {
        self.trigger_now(application_id, TriggerSource::Command, Some(commander.to_string()))
            .await
    }

    /// Create a deployment because live state drifted from git
    pub async fn trigger_drift(&self, application_id: &str) -> Result<(), PipedError> {
        self.trigger_now(application_id, TriggerSource::Drift, None).await
    }

    /// Create deployments for the applications bound to an image update
    pub async fn trigger_for_image(&self, event: &ImageUpdateEvent) -> Result<(), PipedError> {
        info!(
            "image {}:{} advanced; triggering {} applications",
            event.image,
            event.tag,
            event.application_ids.len()
        );
        let suppressed = self.active_applications().await?;
        for application_id in &event.application_ids {
            if suppressed.contains(application_id) {
                continue;
            }
            if let Err(e) = self
                .trigger_now(application_id, TriggerSource::ImageUpdate, None)
                .await
            {
                warn!("image trigger for {} failed: {}", application_id, e);
            }
        }
        Ok(())
    }

    async fn trigger_now(
        &self,
        application_id: &str,
        source: TriggerSource,
        commander: Option<String>,
    ) -> Result<(), PipedError> {
        let app = self
            .appstore
            .get(application_id)
            .ok_or_else(|| PipedError::NotFound(format!("application {}", application_id)))?;
        if !app.is_deployable() {
            return Err(PipedError::Command(format!(
                "application {} is not deployable",
                application_id
            )));
        }

        let suppressed = self.active_applications().await?;
        if suppressed.contains(application_id) {
            return Err(PipedError::Command(format!(
                "application {} already has a deployment in flight",
                application_id
            )));
        }

        let head = self.workspaces.clone_or_fetch(&app.repo_id).await?;
        let last = {
            let state = self.last_triggered.lock().await;
            state.get(&app.id).cloned()
        };
        self.create_deployment(&app, last, &head, source, commander)
            .await
    }

    /// Submit the deployment and, only once acknowledged, persist the
    /// last-triggered commit.
    async fn create_deployment(
        &self,
        app: &Application,
        from: Option<String>,
        to: &str,
        source: TriggerSource,
        commander: Option<String>,
    ) -> Result<(), PipedError> {
        let request = CreateDeploymentRequest {
            application_id: app.id.clone(),
            repo_id: app.repo_id.clone(),
            app_path: app.path.clone(),
            kind: app.kind,
            trigger: Trigger {
                commit_from: from,
                commit_to: to.to_string(),
                source,
                commander,
                timestamp: Utc::now(),
            },
        };

        let deployment_id = self.api.create_deployment(request).await?;
        info!(
            "created deployment {} for {} at {}",
            deployment_id, app.id, to
        );

        let snapshot = {
            let mut state = self.last_triggered.lock().await;
            state.insert(app.id.clone(), to.to_string());
            state.clone()
        };
        if let Err(e) = self
            .state_file
            .write_atomic(serde_json::to_vec_pretty(&snapshot)?.as_slice())
            .await
        {
            warn!("failed to persist trigger state: {}", e);
        }
        Ok(())
    }

    /// Applications with a non-terminal deployment right now
    async fn active_applications(&self) -> Result<HashSet<String>, PipedError> {
        let deployments = self.api.list_not_completed_deployments().await?;
        Ok(deployments
            .into_iter()
            .map(|d| d.application_id)
            .collect())
    }
}
