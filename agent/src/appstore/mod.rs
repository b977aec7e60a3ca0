//! In-memory application index.
//!
//! The authoritative set of applications discovered by scanning each
//! repository's configuration files. Rebuilt per repository after
//! `clone_or_fetch`, then diffed against the current set to emit
//! Added/Updated/Deleted events. Readers always see a complete snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};

use crate::config::app::{ApplicationConfig, APPLICATION_CONFIG_FILENAME};
use crate::errors::PipedError;
use crate::model::application::Application;
use crate::utils::{generate_uuid, sha256_hash};

/// A change observed on one application
#[derive(Debug, Clone)]
pub enum ApplicationChange {
    Added(Application),
    Updated(Application),
    Deleted(String),
}

/// One application's config file found while scanning a repository checkout
#[derive(Debug, Clone)]
pub struct ScannedApp {
    /// Directory path relative to the repository root
    pub path: String,

    /// Raw file contents
    pub contents: String,
}

/// Holds the authoritative in-memory set of applications
pub struct ApplicationStore {
    project_id: String,
    apps: RwLock<HashMap<String, Application>>,
    events: tokio::sync::broadcast::Sender<ApplicationChange>,
}

impl ApplicationStore {
    pub fn new(project_id: &str) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(256);
        Self {
            project_id: project_id.to_string(),
            apps: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn list(&self) -> Vec<Application> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        apps.values().cloned().collect()
    }

    pub fn list_by_repo(&self, repo_id: &str) -> Vec<Application> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        apps.values()
            .filter(|a| a.repo_id == repo_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Application> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        apps.get(id).cloned()
    }

    /// Subscribe to application changes
    pub fn watch(&self) -> tokio::sync::broadcast::Receiver<ApplicationChange> {
        self.events.subscribe()
    }

    /// Replace one repository's applications with a fresh scan result,
    /// emitting a change event per difference. `(repo_id, path)` identifies
    /// an application across scans; ids are assigned on first discovery.
    pub fn sync_repo(&self, repo_id: &str, scanned: Vec<ScannedApp>) {
        let mut changes = Vec::new();
        {
            let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());

            let mut existing_by_path: HashMap<String, String> = apps
                .values()
                .filter(|a| a.repo_id == repo_id)
                .map(|a| (a.path.clone(), a.id.clone()))
                .collect();

            for found in scanned {
                let digest = sha256_hash(found.contents.as_bytes());
                let (config, config_error) = match ApplicationConfig::parse(&found.contents) {
                    Ok(c) => (Some(c), None),
                    Err(e) => {
                        warn!(
                            "invalid application config at {}/{}: {}",
                            repo_id, found.path, e
                        );
                        (None, Some(e.to_string()))
                    }
                };

                match existing_by_path.remove(&found.path) {
                    Some(id) => {
                        let Some(app) = apps.get_mut(&id) else {
                            continue;
                        };
                        let dirty =
                            app.config_digest != digest || app.disabled || app.config.is_none();
                        if dirty {
                            if let Some(config) = &config {
                                app.kind = config.kind;
                                app.cloud_provider = config.cloud_provider.clone();
                            }
                            app.config = config;
                            app.config_error = config_error;
                            app.config_digest = digest;
                            app.disabled = false;
                            app.updated_at = Utc::now();
                            changes.push(ApplicationChange::Updated(app.clone()));
                        }
                    }
                    None => {
                        let Some(config) = config else {
                            // Never admit an application whose very first
                            // observation is unparseable; it has no kind yet.
                            continue;
                        };
                        let app = Application {
                            id: generate_uuid(),
                            project_id: self.project_id.clone(),
                            kind: config.kind,
                            repo_id: repo_id.to_string(),
                            path: found.path.clone(),
                            cloud_provider: config.cloud_provider.clone(),
                            config: Some(config),
                            config_error: None,
                            config_digest: digest,
                            latest_deployment_id: None,
                            disabled: false,
                            updated_at: Utc::now(),
                        };
                        info!("discovered application at {}/{}", repo_id, found.path);
                        apps.insert(app.id.clone(), app.clone());
                        changes.push(ApplicationChange::Added(app));
                    }
                }
            }

            // Whatever is left was not found in this scan: soft-delete.
            for (_, id) in existing_by_path {
                if let Some(app) = apps.get_mut(&id) {
                    if !app.disabled {
                        app.disabled = true;
                        app.updated_at = Utc::now();
                        changes.push(ApplicationChange::Deleted(id.clone()));
                    }
                }
            }
        }

        for change in changes {
            let _ = self.events.send(change);
        }
    }
}

/// Walk a repository checkout looking for application config files.
///
/// Returns one entry per directory containing an application config,
/// with paths relative to the checkout root.
pub async fn scan_checkout(root: &Path) -> Result<Vec<ScannedApp>, PipedError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                if name != ".git" {
                    pending.push(path);
                }
            } else if name == APPLICATION_CONFIG_FILENAME {
                let contents = fs::read_to_string(&path).await?;
                let rel = path
                    .parent()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                found.push(ScannedApp {
                    path: rel,
                    contents,
                });
            }
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}
