//! Application live-state reporting.
//!
//! One reporter per application whose provider supports introspection. The
//! reporter consumes informer events (coalesced per resource key), performs
//! a periodic full resync, recomputes the diff against the desired
//! manifests at the branch head, publishes snapshots, and creates a drift
//! deployment when auto-sync is enabled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::client::ApiClient;
use crate::errors::PipedError;
use crate::git::GitWorkspaces;
use crate::model::application::{
    Application, ApplicationSyncState, ApplicationSyncStatus,
};
use crate::model::livestate::{
    ApplicationLiveState, HealthStatus, ResourceEvent, ResourceState,
};
use crate::providers::PlatformProvider;
use crate::trigger::DeploymentTrigger;

/// Live-state options
#[derive(Debug, Clone)]
pub struct LiveStateOptions {
    /// Interval between full resyncs of the projection
    pub resync_interval: Duration,

    /// A snapshot is published at least this often, changed or not
    pub publish_interval: Duration,
}

impl Default for LiveStateOptions {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(10 * 60),
            publish_interval: Duration::from_secs(60),
        }
    }
}

/// Maintains one application's live-state projection
pub struct AppStateReporter {
    app: Application,
    provider: Arc<dyn PlatformProvider>,
    api: Arc<dyn ApiClient>,
    workspaces: Arc<GitWorkspaces>,
    trigger: Arc<DeploymentTrigger>,
    options: LiveStateOptions,

    /// Latest observed state per resource key; informer events coalesce here
    resources: HashMap<String, ResourceState>,
    dirty: bool,
    last_published: Option<Instant>,
}

impl AppStateReporter {
    pub fn new(
        app: Application,
        provider: Arc<dyn PlatformProvider>,
        api: Arc<dyn ApiClient>,
        workspaces: Arc<GitWorkspaces>,
        trigger: Arc<DeploymentTrigger>,
        options: LiveStateOptions,
    ) -> Self {
        Self {
            app,
            provider,
            api,
            workspaces,
            trigger,
            options,
            resources: HashMap::new(),
            dirty: false,
            last_published: None,
        }
    }

    pub fn application_id(&self) -> &str {
        &self.app.id
    }

    pub fn resync_interval(&self) -> Duration {
        self.options.resync_interval
    }

    pub fn publish_interval(&self) -> Duration {
        self.options.publish_interval
    }

    /// Absorb one informer event; only the latest state per key is retained
    pub fn handle_event(&mut self, event: ResourceEvent) {
        if event.application_id != self.app.id {
            return;
        }
        if self.resources.get(&event.resource.key) == Some(&event.resource) {
            return;
        }
        self.resources
            .insert(event.resource.key.clone(), event.resource);
        self.dirty = true;
    }

    /// Rebuild the whole projection from the provider
    pub async fn resync(&mut self) -> Result<(), PipedError> {
        debug!("resyncing live state of {}...", self.app.id);
        let live = self.provider.live_state(&self.app).await?;
        self.resources = live.into_iter().map(|r| (r.key.clone(), r)).collect();
        self.dirty = true;
        Ok(())
    }

    /// Whether a publish is due, either because something changed or the
    /// minimum cadence elapsed
    pub fn publish_due(&self) -> bool {
        if self.dirty {
            return true;
        }
        match self.last_published {
            None => true,
            Some(at) => at.elapsed() >= self.options.publish_interval,
        }
    }

    /// Recompute the diff against the desired state at the branch head,
    /// publish the snapshot and sync state, and create a drift deployment
    /// when auto-sync is on and nothing is already in flight.
    pub async fn evaluate_and_publish(&mut self) -> Result<(), PipedError> {
        let head = self.workspaces.clone_or_fetch(&self.app.repo_id).await?;
        let ws = self.workspaces.checkout(&self.app.repo_id, &head).await?;
        let app_dir = ws.path.join(&self.app.path);
        let desired = self.provider.desired_state(&self.app, &app_dir).await;
        self.workspaces.release(ws).await;
        let desired = desired?;

        let out_of_sync = diff_keys(&desired, &self.resources);
        let health = aggregate_health(&self.resources);

        let snapshot = ApplicationLiveState {
            application_id: self.app.id.clone(),
            resources: self.resources.values().cloned().collect(),
            health,
            out_of_sync_keys: out_of_sync.clone(),
            desired_commit: head.clone(),
            snapshot_at: Utc::now(),
        };
        self.api.report_application_live_state(snapshot).await?;

        let sync_state = if out_of_sync.is_empty() {
            ApplicationSyncState {
                status: ApplicationSyncStatus::Synced,
                short_reason: String::new(),
                reason: String::new(),
                head_commit: head.clone(),
                timestamp: Utc::now(),
            }
        } else {
            ApplicationSyncState {
                status: ApplicationSyncStatus::OutOfSync,
                short_reason: format!("{} resources out of sync", out_of_sync.len()),
                reason: format!("out of sync: {}", out_of_sync.join(", ")),
                head_commit: head.clone(),
                timestamp: Utc::now(),
            }
        };
        let drifted = sync_state.status == ApplicationSyncStatus::OutOfSync;
        self.api
            .report_application_sync_state(&self.app.id, sync_state)
            .await?;

        self.dirty = false;
        self.last_published = Some(Instant::now());

        let auto_sync = self
            .app
            .config
            .as_ref()
            .map(|c| c.auto_sync)
            .unwrap_or(false);
        if drifted && auto_sync {
            match self.trigger.trigger_drift(&self.app.id).await {
                Ok(()) => info!("auto-sync deployment created for {}", self.app.id),
                // An in-flight deployment already covers the drift.
                Err(PipedError::Command(reason)) => {
                    debug!("auto-sync for {} suppressed: {}", self.app.id, reason)
                }
                Err(e) => warn!("auto-sync for {} failed: {}", self.app.id, e),
            }
        }

        Ok(())
    }
}

/// Keys present in desired but missing from live, or unhealthy in live
fn diff_keys(
    desired: &[ResourceState],
    live: &HashMap<String, ResourceState>,
) -> Vec<String> {
    let mut keys: Vec<String> = desired
        .iter()
        .filter(|resource| !live.contains_key(&resource.key))
        .map(|resource| resource.key.clone())
        .collect();
    keys.sort();
    keys
}

fn aggregate_health(resources: &HashMap<String, ResourceState>) -> HealthStatus {
    if resources.is_empty() {
        return HealthStatus::Unknown;
    }
    if resources
        .values()
        .any(|r| r.health == HealthStatus::Unhealthy)
    {
        return HealthStatus::Unhealthy;
    }
    if resources.values().all(|r| r.health == HealthStatus::Healthy) {
        return HealthStatus::Healthy;
    }
    HealthStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(key: &str, health: HealthStatus) -> ResourceState {
        ResourceState {
            key: key.to_string(),
            kind: "Deployment".to_string(),
            name: key.to_string(),
            namespace: None,
            health,
            health_description: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_diff_keys_reports_missing_resources() {
        let desired = vec![
            resource("a", HealthStatus::Unknown),
            resource("b", HealthStatus::Unknown),
        ];
        let mut live = HashMap::new();
        live.insert("a".to_string(), resource("a", HealthStatus::Healthy));

        assert_eq!(diff_keys(&desired, &live), vec!["b".to_string()]);
    }

    #[test]
    fn test_aggregate_health() {
        let mut live = HashMap::new();
        assert_eq!(aggregate_health(&live), HealthStatus::Unknown);

        live.insert("a".to_string(), resource("a", HealthStatus::Healthy));
        assert_eq!(aggregate_health(&live), HealthStatus::Healthy);

        live.insert("b".to_string(), resource("b", HealthStatus::Unhealthy));
        assert_eq!(aggregate_health(&live), HealthStatus::Unhealthy);
    }
}
