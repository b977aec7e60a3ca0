//! Application models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::app::ApplicationConfig;

/// Provider type an application deploys through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationKind {
    Kubernetes,
    Terraform,
    #[serde(rename = "CLOUDRUN")]
    CloudRun,
    Lambda,
}

impl ApplicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kubernetes => "KUBERNETES",
            Self::Terraform => "TERRAFORM",
            Self::CloudRun => "CLOUDRUN",
            Self::Lambda => "LAMBDA",
        }
    }
}

impl std::fmt::Display for ApplicationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A deployable unit discovered from a configuration file in a git repository.
///
/// `(repo_id, path)` is unique within a project; the id is assigned on first
/// discovery and stable for the life of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Stable identifier
    pub id: String,

    /// Project this application belongs to
    pub project_id: String,

    /// Provider type
    pub kind: ApplicationKind,

    /// Repository the application lives in
    pub repo_id: String,

    /// Directory path of the application inside the repository
    pub path: String,

    /// Name of the cloud provider the application deploys through
    pub cloud_provider: String,

    /// Parsed configuration; None when the config file failed to parse
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ApplicationConfig>,

    /// Parse failure detail when config is None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,

    /// Content hash of the configuration file
    pub config_digest: String,

    /// Id of the most recently observed deployment, resolved through the API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_deployment_id: Option<String>,

    /// Soft-delete flag, set when the config file disappears from the repo
    pub disabled: bool,

    /// Last time this record changed
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// Whether the application can currently be deployed
    pub fn is_deployable(&self) -> bool {
        !self.disabled && self.config.is_some()
    }
}

/// Aggregate sync status of an application against its desired git state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationSyncStatus {
    Unknown,
    Synced,
    OutOfSync,
    Deploying,
    InvalidConfig,
}

/// Sync state reported to the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSyncState {
    pub status: ApplicationSyncStatus,
    pub short_reason: String,
    pub reason: String,
    pub head_commit: String,
    pub timestamp: DateTime<Utc>,
}
