//! The piped configuration file

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, DeserializeOwned};
use serde::Deserialize;
use tokio::fs;

use crate::errors::PipedError;
use crate::logs::LogLevel;
use crate::model::application::ApplicationKind;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_PULL_INTERVAL_SECS: u64 = 300;

/// Name of the kubernetes provider appended when none is configured
pub const DEFAULT_KUBERNETES_PROVIDER: &str = "kubernetes-default";

/// Configurable data used while running the agent
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipedConfig {
    /// The identifier of the project this piped belongs to
    pub project_id: String,

    /// The unique identifier generated for this piped
    pub piped_id: String,

    /// Path to the file containing the generated key for this piped
    pub piped_key_file: PathBuf,

    /// Address used to connect to the control-plane API
    pub api_address: String,

    /// Address of the control-plane web
    pub web_address: String,

    /// How often to check whether an application should be synced, in seconds
    #[serde(rename = "syncInterval")]
    pub sync_interval_secs: u64,

    /// Git configuration needed for git commands
    pub git: GitConfig,

    /// Repositories this piped will handle
    pub repositories: Vec<Repository>,

    /// Helm chart repositories added at startup
    pub chart_repositories: Vec<ChartRepository>,

    /// Cloud providers usable by this piped
    pub cloud_providers: Vec<CloudProvider>,

    /// Analysis providers usable by this piped
    pub analysis_providers: Vec<AnalysisProvider>,

    /// Image providers usable by this piped
    pub image_providers: Vec<ImageProvider>,

    /// Notification routing; delivery is handled by the control plane
    pub notifications: Notifications,

    /// How sealed secrets should be managed
    pub sealed_secret_management: Option<SealedSecretManagement>,

    pub log_level: LogLevel,

    /// Base directory for mirrors, workspaces, tools and state
    pub base_dir: Option<PathBuf>,
}

impl PipedConfig {
    /// Load and validate a configuration file
    pub async fn load(path: &Path) -> Result<Self, PipedError> {
        let contents = fs::read_to_string(path).await?;
        let mut config: PipedConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        config.enable_default_kubernetes_provider();
        Ok(config)
    }

    /// Validate configured data of all fields
    pub fn validate(&mut self) -> Result<(), PipedError> {
        if self.project_id.is_empty() {
            return Err(PipedError::Config("projectId must be set".to_string()));
        }
        if self.piped_id.is_empty() {
            return Err(PipedError::Config("pipedId must be set".to_string()));
        }
        if self.piped_key_file.as_os_str().is_empty() {
            return Err(PipedError::Config("pipedKeyFile must be set".to_string()));
        }
        if self.api_address.is_empty() {
            return Err(PipedError::Config("apiAddress must be set".to_string()));
        }
        if self.web_address.is_empty() {
            return Err(PipedError::Config("webAddress must be set".to_string()));
        }
        if self.sync_interval_secs == 0 {
            self.sync_interval_secs = DEFAULT_SYNC_INTERVAL_SECS;
        }
        let mut repo_ids = std::collections::HashSet::new();
        for repo in &self.repositories {
            if !repo_ids.insert(repo.repo_id.as_str()) {
                return Err(PipedError::Config(format!(
                    "repository id {} is configured twice",
                    repo.repo_id
                )));
            }
        }
        if let Some(ssm) = &self.sealed_secret_management {
            ssm.validate()?;
        }
        Ok(())
    }

    /// Add the default kubernetes cloud provider if it was not specified
    pub fn enable_default_kubernetes_provider(&mut self) {
        let exists = self
            .cloud_providers
            .iter()
            .any(|cp| cp.name == DEFAULT_KUBERNETES_PROVIDER);
        if !exists {
            self.cloud_providers.push(CloudProvider {
                name: DEFAULT_KUBERNETES_PROVIDER.to_string(),
                spec: CloudProviderSpec::Kubernetes(KubernetesProviderConfig::default()),
            });
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Find a cloud provider by name
    pub fn find_cloud_provider(&self, name: &str) -> Option<&CloudProvider> {
        self.cloud_providers.iter().find(|p| p.name == name)
    }

    /// Find an analysis provider by name
    pub fn find_analysis_provider(&self, name: &str) -> Option<&AnalysisProvider> {
        self.analysis_providers.iter().find(|p| p.name == name)
    }

    /// Map of repositories keyed by repo id
    pub fn repository_map(&self) -> HashMap<String, Repository> {
        self.repositories
            .iter()
            .map(|r| (r.repo_id.clone(), r.clone()))
            .collect()
    }

    /// Find a repository with the given id from the configured list
    pub fn repository(&self, id: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.repo_id == id)
    }
}

/// Git configuration needed for git commands
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitConfig {
    /// The username configured for the `git` user
    pub username: String,

    /// The email configured for the `git` user
    pub email: String,

    /// The host name, e.g. github.com
    pub host: String,

    /// Path to the private ssh key used to clone the configured repositories
    pub ssh_key_file: Option<PathBuf>,

    /// Where to write the generated ssh config file
    pub ssh_config_file_path: Option<PathBuf>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            username: "piped".to_string(),
            email: "piped@localhost".to_string(),
            host: "github.com".to_string(),
            ssh_key_file: None,
            ssh_config_file_path: None,
        }
    }
}

impl GitConfig {
    pub fn should_configure_ssh(&self) -> bool {
        self.ssh_key_file.is_some()
    }
}

/// One git repository handled by this piped
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Unique identifier for this repository within the piped scope
    pub repo_id: String,

    /// Remote address used to clone the source code
    pub remote: String,

    /// The branch to be handled
    pub branch: String,
}

/// A helm chart repository added at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChartRepository {
    pub name: String,
    pub address: String,
    pub username: String,
    pub password: String,
}

/// A cloud provider entry: `{name, type, config}` where `type` selects the
/// concrete config schema. Unknown types are rejected at parse time.
#[derive(Debug, Clone)]
pub struct CloudProvider {
    pub name: String,
    pub spec: CloudProviderSpec,
}

#[derive(Debug, Clone)]
pub enum CloudProviderSpec {
    Kubernetes(KubernetesProviderConfig),
    Terraform(TerraformProviderConfig),
    CloudRun(CloudRunProviderConfig),
    Lambda(LambdaProviderConfig),
}

impl CloudProviderSpec {
    pub fn kind(&self) -> ApplicationKind {
        match self {
            Self::Kubernetes(_) => ApplicationKind::Kubernetes,
            Self::Terraform(_) => ApplicationKind::Terraform,
            Self::CloudRun(_) => ApplicationKind::CloudRun,
            Self::Lambda(_) => ApplicationKind::Lambda,
        }
    }
}

impl<'de> Deserialize<'de> for CloudProvider {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            config: serde_yaml::Value,
        }

        let raw = Raw::deserialize(deserializer)?;
        let spec = match raw.kind.as_str() {
            "KUBERNETES" => CloudProviderSpec::Kubernetes(section(raw.config)?),
            "TERRAFORM" => CloudProviderSpec::Terraform(section(raw.config)?),
            "CLOUDRUN" => CloudProviderSpec::CloudRun(section(raw.config)?),
            "LAMBDA" => CloudProviderSpec::Lambda(section(raw.config)?),
            other => {
                return Err(de::Error::custom(format!(
                    "unsupported cloud provider type: {}",
                    other
                )))
            }
        };
        Ok(CloudProvider {
            name: raw.name,
            spec,
        })
    }
}

/// Decode a provider `config` section, treating an absent section as default
fn section<T, E>(value: serde_yaml::Value) -> Result<T, E>
where
    T: DeserializeOwned + Default,
    E: de::Error,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(value).map_err(de::Error::custom)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesProviderConfig {
    /// The master URL of the cluster; empty means in-cluster
    pub master_url: String,

    /// Path to the kubeconfig file; empty means in-cluster
    pub kube_config_path: String,

    /// Configuration for the application resource informer
    pub app_state_informer: KubernetesAppStateInformer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesAppStateInformer {
    /// Only watch the specified namespace; empty means all namespaces
    pub namespace: String,

    /// Resources added to the watching targets
    pub include_resources: Vec<KubernetesResourceMatcher>,

    /// Resources excluded from the watching targets
    pub exclude_resources: Vec<KubernetesResourceMatcher>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesResourceMatcher {
    pub api_version: String,

    /// Empty means all kinds match
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerraformProviderConfig {
    /// Variables set directly on terraform commands with the -var flag,
    /// formatted as `key=value`
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudRunProviderConfig {
    pub project: String,
    pub region: String,
    pub credentials_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LambdaProviderConfig {
    pub region: String,
}

/// An analysis provider entry, tagged by `type`
#[derive(Debug, Clone)]
pub struct AnalysisProvider {
    pub name: String,
    pub spec: AnalysisProviderSpec,
}

#[derive(Debug, Clone)]
pub enum AnalysisProviderSpec {
    Prometheus(PrometheusConfig),
    Datadog(DatadogConfig),
    Stackdriver(StackdriverConfig),
}

impl<'de> Deserialize<'de> for AnalysisProvider {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            config: serde_yaml::Value,
        }

        let raw = Raw::deserialize(deserializer)?;
        let spec = match raw.kind.as_str() {
            "PROMETHEUS" => AnalysisProviderSpec::Prometheus(section(raw.config)?),
            "DATADOG" => AnalysisProviderSpec::Datadog(section(raw.config)?),
            "STACKDRIVER" => AnalysisProviderSpec::Stackdriver(section(raw.config)?),
            other => {
                return Err(de::Error::custom(format!(
                    "unsupported analysis provider type: {}",
                    other
                )))
            }
        };
        Ok(AnalysisProvider {
            name: raw.name,
            spec,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusConfig {
    pub address: String,
    pub username_file: String,
    pub password_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatadogConfig {
    pub address: String,
    pub api_key_file: String,
    pub application_key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackdriverConfig {
    pub service_account_file: String,
}

/// An image provider entry, tagged by `type`, with a per-provider poll cadence
#[derive(Debug, Clone)]
pub struct ImageProvider {
    pub name: String,
    pub pull_interval_secs: u64,
    pub spec: ImageProviderSpec,
}

impl ImageProvider {
    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }
}

#[derive(Debug, Clone)]
pub enum ImageProviderSpec {
    Dockerhub(DockerhubConfig),
    Gcr(GcrConfig),
    Ecr(EcrConfig),
}

impl<'de> Deserialize<'de> for ImageProvider {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            #[serde(rename = "type")]
            kind: String,
            #[serde(rename = "pullInterval", default)]
            pull_interval_secs: u64,
            #[serde(default)]
            config: serde_yaml::Value,
        }

        let raw = Raw::deserialize(deserializer)?;
        let spec = match raw.kind.as_str() {
            "DOCKERHUB" => ImageProviderSpec::Dockerhub(section(raw.config)?),
            "GCR" => ImageProviderSpec::Gcr(section(raw.config)?),
            "ECR" => ImageProviderSpec::Ecr(section(raw.config)?),
            other => {
                return Err(de::Error::custom(format!(
                    "unsupported image provider type: {}",
                    other
                )))
            }
        };
        let pull_interval_secs = if raw.pull_interval_secs == 0 {
            DEFAULT_PULL_INTERVAL_SECS
        } else {
            raw.pull_interval_secs
        };
        Ok(ImageProvider {
            name: raw.name,
            pull_interval_secs,
            spec,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerhubConfig {
    pub username: String,
    pub password_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcrConfig {
    pub domain: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EcrConfig {
    pub region: String,
}

/// Notification routing tables; parsed and validated here, delivered elsewhere
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Notifications {
    pub routes: Vec<NotificationRoute>,
    pub receivers: Vec<NotificationReceiver>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationRoute {
    pub name: String,
    pub receiver: String,
    pub events: Vec<String>,
    pub ignore_events: Vec<String>,
    pub groups: Vec<String>,
    pub ignore_groups: Vec<String>,
    pub apps: Vec<String>,
    pub ignore_apps: Vec<String>,
    pub envs: Vec<String>,
    pub ignore_envs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationReceiver {
    pub name: String,
    pub slack: Option<SlackReceiver>,
    pub webhook: Option<WebhookReceiver>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlackReceiver {
    pub hook_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookReceiver {
    pub url: String,
}

/// How sealed secrets should be managed, tagged by `type`
#[derive(Debug, Clone)]
pub enum SealedSecretManagement {
    SealingKey {
        private_key_file: PathBuf,
        public_key_file: PathBuf,
    },
    GcpKms {
        key_name: String,
        decrypt_service_account_file: String,
        encrypt_service_account_file: String,
    },
}

impl SealedSecretManagement {
    pub fn validate(&self) -> Result<(), PipedError> {
        match self {
            Self::SealingKey {
                private_key_file,
                public_key_file,
            } => {
                if private_key_file.as_os_str().is_empty() {
                    return Err(PipedError::Config("privateKeyFile must be set".to_string()));
                }
                if public_key_file.as_os_str().is_empty() {
                    return Err(PipedError::Config("publicKeyFile must be set".to_string()));
                }
                Ok(())
            }
            Self::GcpKms {
                key_name,
                decrypt_service_account_file,
                encrypt_service_account_file,
            } => {
                if key_name.is_empty() {
                    return Err(PipedError::Config("keyName must be set".to_string()));
                }
                if decrypt_service_account_file.is_empty() {
                    return Err(PipedError::Config(
                        "decryptServiceAccountFile must be set".to_string(),
                    ));
                }
                if encrypt_service_account_file.is_empty() {
                    return Err(PipedError::Config(
                        "encryptServiceAccountFile must be set".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl<'de> Deserialize<'de> for SealedSecretManagement {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            config: serde_yaml::Value,
        }

        #[derive(Default, Deserialize)]
        #[serde(rename_all = "camelCase", default)]
        struct SealingKeyRaw {
            private_key_file: PathBuf,
            public_key_file: PathBuf,
        }

        #[derive(Default, Deserialize)]
        #[serde(rename_all = "camelCase", default)]
        struct GcpKmsRaw {
            key_name: String,
            decrypt_service_account_file: String,
            encrypt_service_account_file: String,
        }

        let raw = Raw::deserialize(deserializer)?;
        match raw.kind.as_str() {
            "SEALING_KEY" => {
                let c: SealingKeyRaw = section(raw.config)?;
                Ok(SealedSecretManagement::SealingKey {
                    private_key_file: c.private_key_file,
                    public_key_file: c.public_key_file,
                })
            }
            "GCP_KMS" => {
                let c: GcpKmsRaw = section(raw.config)?;
                Ok(SealedSecretManagement::GcpKms {
                    key_name: c.key_name,
                    decrypt_service_account_file: c.decrypt_service_account_file,
                    encrypt_service_account_file: c.encrypt_service_account_file,
                })
            }
            other => Err(de::Error::custom(format!(
                "unsupported sealed secret management type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
projectId: demo
pipedId: piped-1
pipedKeyFile: /etc/piped/key
apiAddress: https://api.cd.example.com
webAddress: https://app.cd.example.com
syncInterval: 30
git:
  username: bot
  email: bot@example.com
repositories:
  - repoId: main
    remote: git@github.com:org/deploy.git
    branch: master
cloudProviders:
  - name: terraform-prod
    type: TERRAFORM
    config:
      vars: ["region=us-east-1"]
imageProviders:
  - name: hub
    type: DOCKERHUB
    config:
      username: bot
      passwordFile: /etc/piped/hub-password
"#;

    #[test]
    fn test_parse_and_validate() {
        let mut config: PipedConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        config.enable_default_kubernetes_provider();

        assert_eq!(config.project_id, "demo");
        assert_eq!(config.sync_interval_secs, 30);
        assert_eq!(config.repositories.len(), 1);
        assert!(config.find_cloud_provider("terraform-prod").is_some());
        // The default kubernetes provider is appended when absent.
        assert!(config.find_cloud_provider(DEFAULT_KUBERNETES_PROVIDER).is_some());
        // Image provider pull interval falls back to the default.
        assert_eq!(config.image_providers[0].pull_interval_secs, 300);
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        let mut config: PipedConfig = serde_yaml::from_str("pipedId: x").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("projectId"));
    }

    #[test]
    fn test_unknown_provider_type_rejected() {
        let doc = r#"
cloudProviders:
  - name: x
    type: NOMAD
"#;
        let parsed: Result<PipedConfig, _> = serde_yaml::from_str(doc);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_sealed_secret_management() {
        let doc = r#"
type: SEALING_KEY
config:
  privateKeyFile: /etc/piped/sealing-key
  publicKeyFile: /etc/piped/sealing-key.pub
"#;
        let ssm: SealedSecretManagement = serde_yaml::from_str(doc).unwrap();
        ssm.validate().unwrap();

        let missing: SealedSecretManagement = serde_yaml::from_str("type: SEALING_KEY").unwrap();
        assert!(missing.validate().is_err());
    }
}
