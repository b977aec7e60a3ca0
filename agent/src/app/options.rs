//! Application configuration options

use std::time::Duration;

use crate::controller::ControllerOptions;
use crate::git::WorkspaceOptions;
use crate::reporter::ReporterOptions;
use crate::workers;

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Checkout pool configuration
    pub workspace: WorkspaceOptions,

    /// Deployment controller configuration
    pub controller: ControllerOptions,

    /// Progress reporter configuration
    pub reporter: ReporterOptions,

    /// Controller worker options
    pub controller_worker: workers::controller::Options,

    /// Trigger worker options (one worker per repository)
    pub trigger_worker: workers::trigger::Options,

    /// Command stream worker options
    pub commandstream_worker: workers::commandstream::Options,

    /// Live-state worker options
    pub livestate_worker: workers::livestate::Options,

    /// Stat reporter worker options
    pub statreporter_worker: workers::statreporter::Options,
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
