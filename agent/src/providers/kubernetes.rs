//! Kubernetes platform provider.
//!
//! Renders manifests from the application directory, applies them with a
//! registry-resolved kubectl, and projects live state by polling the
//! cluster. Sealed-secret files are decrypted at render time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::config::app::APPLICATION_CONFIG_FILENAME;
use crate::config::piped::KubernetesProviderConfig;
use crate::crypto::SecretDecrypter;
use crate::errors::PipedError;
use crate::model::application::Application;
use crate::model::livestate::{HealthStatus, ResourceEvent, ResourceState};
use crate::providers::PlatformProvider;
use crate::reporter::StageLogSink;
use crate::toolregistry::ToolRegistry;

const KUBECTL_VERSION: &str = "1.19.3";
const SEALED_SECRET_SUFFIX: &str = ".sealedsecret.yaml";
const INFORMER_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct KubernetesProvider {
    name: String,
    config: KubernetesProviderConfig,
    tools: Arc<ToolRegistry>,
    decrypter: Option<Arc<dyn SecretDecrypter>>,
    events: broadcast::Sender<ResourceEvent>,
}

impl KubernetesProvider {
    pub fn new(
        name: &str,
        config: KubernetesProviderConfig,
        tools: Arc<ToolRegistry>,
        decrypter: Option<Arc<dyn SecretDecrypter>>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            name: name.to_string(),
            config,
            tools,
            decrypter,
            events,
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String, PipedError> {
        let kubectl = self
            .tools
            .resolve("kubectl", KUBECTL_VERSION)
            .await
            .map_err(PipedError::Tool)?;

        let mut cmd = Command::new(kubectl);
        if !self.config.kube_config_path.is_empty() {
            cmd.arg("--kubeconfig").arg(&self.config.kube_config_path);
        }
        if !self.config.master_url.is_empty() {
            cmd.arg("--server").arg(&self.config.master_url);
        }
        cmd.args(args);

        let output = cmd
            .output()
            .await
            .map_err(|e| PipedError::Provider(format!("failed to run kubectl: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipedError::Provider(format!(
                "kubectl {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Copy manifests into a scratch directory, decrypting sealed-secret
    /// files into plain Secret manifests. The pooled checkout is shared and
    /// must never be mutated.
    async fn render(&self, app_dir: &Path) -> Result<PathBuf, PipedError> {
        let rendered = std::env::temp_dir().join(format!("piped-render-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&rendered).await?;

        let mut entries = fs::read_dir(app_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == APPLICATION_CONFIG_FILENAME {
                continue;
            }
            if !name.ends_with(".yaml") && !name.ends_with(".yml") {
                continue;
            }

            if name.ends_with(SEALED_SECRET_SUFFIX) {
                let secret = self.render_sealed_secret(&entry.path()).await?;
                let out = name.replace(SEALED_SECRET_SUFFIX, ".secret.yaml");
                fs::write(rendered.join(out), secret).await?;
            } else {
                fs::copy(entry.path(), rendered.join(&name)).await?;
            }
        }

        Ok(rendered)
    }

    /// Turn one sealed-secret file into a Secret manifest
    async fn render_sealed_secret(&self, path: &Path) -> Result<String, PipedError> {
        let Some(decrypter) = &self.decrypter else {
            return Err(PipedError::Secret(
                "sealed secret found but no sealed secret management is configured".to_string(),
            ));
        };

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SealedSecret {
            name: String,
            #[serde(default)]
            namespace: Option<String>,
            encrypted_data: HashMap<String, String>,
        }

        let contents = fs::read_to_string(path).await?;
        let sealed: SealedSecret = serde_yaml::from_str(&contents)?;

        let mut data = serde_yaml::Mapping::new();
        for (key, ciphertext) in sealed.encrypted_data {
            let raw = base64::engine::general_purpose::STANDARD
                .decode(ciphertext.as_bytes())
                .map_err(|e| PipedError::Secret(format!("invalid ciphertext encoding: {}", e)))?;
            let plain = decrypter.decrypt(&raw).await?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(plain);
            data.insert(
                serde_yaml::Value::String(key),
                serde_yaml::Value::String(encoded),
            );
        }

        let mut metadata = serde_yaml::Mapping::new();
        metadata.insert("name".into(), sealed.name.into());
        if let Some(ns) = sealed.namespace {
            metadata.insert("namespace".into(), ns.into());
        }

        let mut secret = serde_yaml::Mapping::new();
        secret.insert("apiVersion".into(), "v1".into());
        secret.insert("kind".into(), "Secret".into());
        secret.insert("metadata".into(), serde_yaml::Value::Mapping(metadata));
        secret.insert("data".into(), serde_yaml::Value::Mapping(data));

        Ok(serde_yaml::to_string(&serde_yaml::Value::Mapping(secret))?)
    }
}

/// Minimal projection of a manifest document
#[derive(Debug, Deserialize)]
struct ManifestHead {
    #[serde(rename = "apiVersion", default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ManifestMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

fn resource_key(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        api_version,
        kind,
        namespace.unwrap_or("default"),
        name
    )
}

/// Parse every document in every manifest file under one directory
async fn parse_manifests(app_dir: &Path) -> Result<Vec<ResourceState>, PipedError> {
    let mut resources = Vec::new();
    let mut entries = fs::read_dir(app_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == APPLICATION_CONFIG_FILENAME {
            continue;
        }
        if !name.ends_with(".yaml") && !name.ends_with(".yml") {
            continue;
        }

        let contents = fs::read_to_string(entry.path()).await?;
        for doc in contents.split("\n---") {
            if doc.trim().is_empty() {
                continue;
            }
            let head: ManifestHead = match serde_yaml::from_str(doc) {
                Ok(head) => head,
                Err(e) => {
                    warn!("skipping unparsable manifest in {}: {}", name, e);
                    continue;
                }
            };
            if head.kind.is_empty() || head.metadata.name.is_empty() {
                continue;
            }
            resources.push(ResourceState {
                key: resource_key(
                    &head.api_version,
                    &head.kind,
                    head.metadata.namespace.as_deref(),
                    &head.metadata.name,
                ),
                kind: head.kind,
                name: head.metadata.name,
                namespace: head.metadata.namespace,
                health: HealthStatus::Unknown,
                health_description: String::new(),
                updated_at: Utc::now(),
            });
        }
    }

    Ok(resources)
}

#[async_trait]
impl PlatformProvider for KubernetesProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_live_state(&self) -> bool {
        true
    }

    async fn desired_state(
        &self,
        _app: &Application,
        app_dir: &Path,
    ) -> Result<Vec<ResourceState>, PipedError> {
        parse_manifests(app_dir).await
    }

    async fn live_state(&self, app: &Application) -> Result<Vec<ResourceState>, PipedError> {
        let namespace = if self.config.app_state_informer.namespace.is_empty() {
            "default".to_string()
        } else {
            self.config.app_state_informer.namespace.clone()
        };
        let selector = format!("piped.dev/application={}", app.id);

        let out = self
            .kubectl(&[
                "get",
                "all",
                "-n",
                &namespace,
                "-l",
                &selector,
                "-o",
                "json",
            ])
            .await?;

        #[derive(Deserialize)]
        struct ObjectList {
            #[serde(default)]
            items: Vec<serde_json::Value>,
        }

        let list: ObjectList = serde_json::from_str(&out)?;
        let mut resources = Vec::new();
        for item in list.items {
            let api_version = item["apiVersion"].as_str().unwrap_or_default().to_string();
            let kind = item["kind"].as_str().unwrap_or_default().to_string();
            let name = item["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let ns = item["metadata"]["namespace"].as_str().map(|s| s.to_string());
            if kind.is_empty() || name.is_empty() {
                continue;
            }

            // A resource with a Ready=False condition is unhealthy; anything
            // without conditions is reported healthy-by-existence.
            let mut health = HealthStatus::Healthy;
            let mut description = String::new();
            if let Some(conditions) = item["status"]["conditions"].as_array() {
                for condition in conditions {
                    let kind = condition["type"].as_str().unwrap_or_default();
                    let status = condition["status"].as_str().unwrap_or_default();
                    if (kind == "Ready" || kind == "Available") && status != "True" {
                        health = HealthStatus::Unhealthy;
                        description = condition["message"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                    }
                }
            }

            resources.push(ResourceState {
                key: resource_key(&api_version, &kind, ns.as_deref(), &name),
                kind,
                name,
                namespace: ns,
                health,
                health_description: description,
                updated_at: Utc::now(),
            });
        }

        Ok(resources)
    }

    async fn apply(
        &self,
        app: &Application,
        app_dir: &Path,
        logs: &StageLogSink,
    ) -> Result<(), PipedError> {
        let rendered = self.render(app_dir).await?;
        let rendered_str = rendered.to_string_lossy().into_owned();

        logs.info(format!("applying manifests for {}...", app.path)).await;
        let result = self.kubectl(&["apply", "-f", &rendered_str]).await;

        let _ = fs::remove_dir_all(&rendered).await;

        match result {
            Ok(out) => {
                for line in out.lines().filter(|l| !l.is_empty()) {
                    logs.info(line).await;
                }
                Ok(())
            }
            Err(e) => {
                logs.error(e.to_string()).await;
                Err(e)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    /// Poll-based informer: emits an event per changed resource. The change
    /// feed is best-effort; the live-state reporter's periodic resync is the
    /// source of truth.
    async fn run_informer(&self, app: Application, mut cancel: Cancellation) {
        let mut known: HashMap<String, ResourceState> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(INFORMER_POLL_INTERVAL) => {}
            }

            let resources = match self.live_state(&app).await {
                Ok(resources) => resources,
                Err(e) => {
                    debug!("informer poll for {} failed: {}", app.id, e);
                    continue;
                }
            };

            for resource in resources {
                let changed = known
                    .get(&resource.key)
                    .map(|prev| prev.health != resource.health)
                    .unwrap_or(true);
                if changed {
                    known.insert(resource.key.clone(), resource.clone());
                    let _ = self.events.send(ResourceEvent {
                        application_id: app.id.clone(),
                        resource,
                    });
                }
            }
        }
    }
}
