//! Cloud-provider seam.
//!
//! Everything below this boundary (kubectl mechanics, terraform mechanics)
//! is provider-specific; the deployment engine only consumes this trait.

pub mod kubernetes;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::cancel::Cancellation;
use crate::errors::PipedError;
use crate::model::application::Application;
use crate::model::livestate::{ResourceEvent, ResourceState};
use crate::reporter::StageLogSink;

/// A deployment target the agent can render to, apply to and introspect
#[async_trait]
pub trait PlatformProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the target environment can be introspected for live state
    fn supports_live_state(&self) -> bool;

    /// Resources declared by the manifests at the application's directory
    async fn desired_state(
        &self,
        app: &Application,
        app_dir: &Path,
    ) -> Result<Vec<ResourceState>, PipedError>;

    /// Resources currently observed in the target environment
    async fn live_state(&self, app: &Application) -> Result<Vec<ResourceState>, PipedError>;

    /// Apply the manifests at the application's directory to the target
    async fn apply(
        &self,
        app: &Application,
        app_dir: &Path,
        logs: &StageLogSink,
    ) -> Result<(), PipedError>;

    /// Subscribe to resource-change events produced by the informer
    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent>;

    /// Drive the informer for one application until cancelled
    async fn run_informer(&self, app: Application, cancel: Cancellation);
}

/// Maps configured cloud-provider names to their implementations
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PlatformProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn PlatformProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PlatformProvider>> {
        self.providers.get(name).cloned()
    }
}
