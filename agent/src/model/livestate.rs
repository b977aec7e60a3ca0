//! Live-state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a single resource or of an application as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Observed state of one resource in the target environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Unique key within the application, e.g. `apps/v1:Deployment:default:web`
    pub key: String,

    pub kind: String,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub health: HealthStatus,

    /// Short human-readable detail of the current condition
    #[serde(default)]
    pub health_description: String,

    pub updated_at: DateTime<Utc>,
}

/// The last observed projection of an application's resources, plus the diff
/// against the desired state rendered from git.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationLiveState {
    pub application_id: String,
    pub resources: Vec<ResourceState>,
    pub health: HealthStatus,

    /// Keys of resources that differ from the desired manifests
    #[serde(default)]
    pub out_of_sync_keys: Vec<String>,

    /// Commit the desired state was rendered from
    pub desired_commit: String,

    pub snapshot_at: DateTime<Utc>,
}

impl ApplicationLiveState {
    pub fn is_synced(&self) -> bool {
        self.out_of_sync_keys.is_empty()
    }
}

/// A change notification for one resource, emitted by a provider informer
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub application_id: String,
    pub resource: ResourceState,
}
