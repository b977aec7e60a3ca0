//! Tool download backends

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Stages a tool binary at a destination path
#[async_trait]
pub trait ToolInstaller: Send + Sync {
    async fn install(&self, tool: &str, version: &str, dest: &Path) -> Result<(), String>;
}

/// Downloads release binaries over HTTPS from the tools' release endpoints
pub struct HttpToolInstaller {
    client: reqwest::Client,
}

impl HttpToolInstaller {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self { client })
    }

    fn download_url(tool: &str, version: &str) -> String {
        let os = std::env::consts::OS;
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        match tool {
            "kubectl" => format!(
                "https://dl.k8s.io/release/v{}/bin/{}/{}/kubectl",
                version, os, arch
            ),
            "helm" => format!(
                "https://get.helm.sh/helm-v{}-{}-{}",
                version, os, arch
            ),
            _ => format!(
                "https://releases.hashicorp.com/{tool}/{version}/{tool}_{version}_{os}_{arch}",
                tool = tool,
                version = version,
                os = os,
                arch = arch
            ),
        }
    }
}

#[async_trait]
impl ToolInstaller for HttpToolInstaller {
    async fn install(&self, tool: &str, version: &str, dest: &Path) -> Result<(), String> {
        let url = Self::download_url(tool, version);
        debug!("downloading {} {} from {}", tool, version, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("{} returned {}", url, response.status()));
        }

        let mut file = fs::File::create(dest).await.map_err(|e| e.to_string())?;
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        }
        file.sync_all().await.map_err(|e| e.to_string())?;
        Ok(())
    }
}
