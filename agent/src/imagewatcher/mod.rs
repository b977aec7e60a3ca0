//! Image watcher.
//!
//! Per image provider, polls the registry for the tracked images referenced
//! by application configs and emits an image-update event when a tag
//! advances. The deployment trigger consumes these events as an alternative
//! source to git polling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::appstore::ApplicationStore;
use crate::errors::PipedError;
use crate::model::event::ImageUpdateEvent;

/// One observed image tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTag {
    pub tag: String,
    pub digest: String,
}

/// Queries an image registry for the newest tag of an image
#[async_trait]
pub trait ImageRegistryClient: Send + Sync {
    async fn latest_tag(&self, image: &str) -> Result<ImageTag, PipedError>;
}

/// Watches the images one provider is responsible for
pub struct ImageWatcher {
    provider_name: String,
    client: Arc<dyn ImageRegistryClient>,
    appstore: Arc<ApplicationStore>,
    events: mpsc::Sender<ImageUpdateEvent>,
    seen: Mutex<HashMap<String, ImageTag>>,
}

impl ImageWatcher {
    pub fn new(
        provider_name: &str,
        client: Arc<dyn ImageRegistryClient>,
        appstore: Arc<ApplicationStore>,
        events: mpsc::Sender<ImageUpdateEvent>,
    ) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            client,
            appstore,
            events,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// One polling round: gather tracked images from application configs,
    /// query the registry, and emit events for advanced tags.
    pub async fn tick(&self) -> Result<usize, PipedError> {
        // image -> applications referencing it through this provider
        let mut tracked: HashMap<String, Vec<String>> = HashMap::new();
        for app in self.appstore.list() {
            let Some(config) = &app.config else { continue };
            if app.disabled {
                continue;
            }
            for image_ref in &config.trigger.images {
                if image_ref.provider == self.provider_name {
                    tracked
                        .entry(image_ref.image.clone())
                        .or_default()
                        .push(app.id.clone());
                }
            }
        }

        let mut emitted = 0;
        for (image, application_ids) in tracked {
            let latest = match self.client.latest_tag(&image).await {
                Ok(tag) => tag,
                Err(e) => {
                    warn!("tag query for {} failed: {}", image, e);
                    continue;
                }
            };

            let advanced = {
                let mut seen = self.seen.lock().await;
                match seen.get(&image) {
                    // The first observation only primes the baseline.
                    None => {
                        seen.insert(image.clone(), latest.clone());
                        false
                    }
                    Some(previous) if *previous != latest => {
                        seen.insert(image.clone(), latest.clone());
                        true
                    }
                    Some(_) => false,
                }
            };

            if advanced {
                info!(
                    "image {} advanced to {} ({})",
                    image, latest.tag, latest.digest
                );
                let event = ImageUpdateEvent {
                    provider: self.provider_name.clone(),
                    image,
                    tag: latest.tag,
                    digest: latest.digest,
                    application_ids,
                    observed_at: Utc::now(),
                };
                if self.events.send(event).await.is_err() {
                    debug!("image event channel closed");
                    return Ok(emitted);
                }
                emitted += 1;
            }
        }

        Ok(emitted)
    }
}

/// Docker Registry HTTP API v2 client, good enough for anonymous registries
pub struct RegistryV2Client {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryV2Client {
    pub fn new(base_url: &str) -> Result<Self, PipedError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ImageRegistryClient for RegistryV2Client {
    async fn latest_tag(&self, image: &str) -> Result<ImageTag, PipedError> {
        #[derive(serde::Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Vec<String>,
        }

        let url = format!("{}/v2/{}/tags/list", self.base_url, image);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(PipedError::Api(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let list: TagList = response.json().await?;
        let tag = list
            .tags
            .into_iter()
            .max()
            .ok_or_else(|| PipedError::NotFound(format!("no tags for {}", image)))?;

        let manifest_url = format!("{}/v2/{}/manifests/{}", self.base_url, image, tag);
        let response = self.client.head(&manifest_url).send().await?;
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(ImageTag { tag, digest })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::appstore::{ApplicationStore, ScannedApp};

    struct FakeRegistry {
        calls: AtomicU32,
        tags: Vec<&'static str>,
    }

    #[async_trait]
    impl ImageRegistryClient for FakeRegistry {
        async fn latest_tag(&self, _image: &str) -> Result<ImageTag, PipedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let tag = self.tags[call.min(self.tags.len() - 1)];
            Ok(ImageTag {
                tag: tag.to_string(),
                digest: format!("sha256:{}", tag),
            })
        }
    }

    fn store_with_tracked_image() -> Arc<ApplicationStore> {
        let store = Arc::new(ApplicationStore::new("demo"));
        store.sync_repo(
            "main",
            vec![ScannedApp {
                path: "svc/web".to_string(),
                contents: r#"
kind: KUBERNETES
trigger:
  images:
    - provider: hub
      image: org/web
"#
                .to_string(),
            }],
        );
        store
    }

    #[tokio::test]
    async fn test_tag_advance_emits_one_event() {
        let store = store_with_tracked_image();
        let (tx, mut rx) = mpsc::channel(8);
        let registry = Arc::new(FakeRegistry {
            calls: AtomicU32::new(0),
            tags: vec!["v1", "v1", "v2"],
        });
        let watcher = ImageWatcher::new("hub", registry, store, tx);

        // First round primes the baseline, second observes no change.
        assert_eq!(watcher.tick().await.unwrap(), 0);
        assert_eq!(watcher.tick().await.unwrap(), 0);

        // Third round sees the advance.
        assert_eq!(watcher.tick().await.unwrap(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.tag, "v2");
        assert_eq!(event.application_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_untracked_provider_sees_nothing() {
        let store = store_with_tracked_image();
        let (tx, _rx) = mpsc::channel(8);
        let registry = Arc::new(FakeRegistry {
            calls: AtomicU32::new(0),
            tags: vec!["v1"],
        });
        let watcher = ImageWatcher::new("gcr", registry, store, tx);
        assert_eq!(watcher.tick().await.unwrap(), 0);
    }
}
