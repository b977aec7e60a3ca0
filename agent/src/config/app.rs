//! Per-application configuration file

use serde::{Deserialize, Serialize};

use crate::config::piped::DEFAULT_KUBERNETES_PROVIDER;
use crate::errors::PipedError;
use crate::model::application::ApplicationKind;
use crate::model::deployment::StageKind;

/// File name of the application configuration at the application's repo path
pub const APPLICATION_CONFIG_FILENAME: &str = ".piped.yaml";

/// The document at an application's path declaring its kind and pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub kind: ApplicationKind,

    #[serde(default)]
    pub name: Option<String>,

    /// Name of the cloud provider to deploy through
    #[serde(default = "default_cloud_provider")]
    pub cloud_provider: String,

    /// Ordered stage specs; empty means a single SYNC stage plan
    #[serde(default)]
    pub pipeline: Vec<StageSpec>,

    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Create a deployment automatically when live state drifts from git
    #[serde(default)]
    pub auto_sync: bool,
}

impl ApplicationConfig {
    /// Parse an application configuration document
    pub fn parse(contents: &str) -> Result<Self, PipedError> {
        let config: ApplicationConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }
}

fn default_cloud_provider() -> String {
    DEFAULT_KUBERNETES_PROVIDER.to_string()
}

/// One stage in the declared pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    /// The stage kind; names a registered executor
    pub name: StageKind,

    #[serde(default)]
    pub desc: String,

    /// Overall stage timeout in seconds; defaults to six hours
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum retries after a retryable failure
    #[serde(default)]
    pub retries: u32,

    /// Indices of predecessor stages; defaults to the previous stage
    #[serde(default)]
    pub requires: Option<Vec<u32>>,

    /// Opaque stage configuration interpreted by the executor
    #[serde(default, rename = "with")]
    pub config: serde_json::Value,
}

/// Extra trigger inputs beyond the application config file itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerConfig {
    /// Watched path prefixes, relative to the repository root
    pub paths: Vec<String>,

    /// Container images whose tag changes should trigger a deployment
    pub images: Vec<ImageWatchRef>,
}

/// Reference to an image tracked by an image provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageWatchRef {
    /// Name of a configured image provider
    pub provider: String,

    /// Image repository, e.g. `org/web`
    pub image: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipeline() {
        let doc = r#"
kind: KUBERNETES
cloudProvider: kubernetes-default
pipeline:
  - name: ANALYSIS
    timeoutSecs: 600
    with:
      durationSecs: 300
  - name: WAIT_APPROVAL
    with:
      timeoutSecs: 60
  - name: SYNC
autoSync: true
trigger:
  paths:
    - charts/web
"#;
        let config = ApplicationConfig::parse(doc).unwrap();
        assert_eq!(config.kind, ApplicationKind::Kubernetes);
        assert_eq!(config.pipeline.len(), 3);
        assert_eq!(config.pipeline[0].name, StageKind::Analysis);
        assert_eq!(config.pipeline[1].name, StageKind::WaitApproval);
        assert!(config.auto_sync);
        assert_eq!(config.trigger.paths, vec!["charts/web".to_string()]);
    }

    #[test]
    fn test_empty_pipeline_defaults() {
        let config = ApplicationConfig::parse("kind: TERRAFORM").unwrap();
        assert!(config.pipeline.is_empty());
        assert!(!config.auto_sync);
        assert_eq!(config.cloud_provider, DEFAULT_KUBERNETES_PROVIDER);
    }

    #[test]
    fn test_unknown_stage_kind_rejected() {
        let doc = r#"
kind: KUBERNETES
pipeline:
  - name: BLUE_GREEN_FLIP
"#;
        assert!(ApplicationConfig::parse(doc).is_err());
    }
}
