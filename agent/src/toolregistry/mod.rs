//! Registry of external tool binaries (kubectl, helm, terraform).
//!
//! Tools are installed once per `(name, version)` under the agent's base
//! directory and memoised on disk. Concurrent callers for the same pair
//! cause at most one installation; a failed install is retried on the next
//! call.

pub mod installer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::singleflight::SingleFlight;
use crate::utils::sha256_hash;

pub use installer::{HttpToolInstaller, ToolInstaller};

const SUPPORTED_TOOLS: &[&str] = &["kubectl", "helm", "terraform"];

/// Errors surfaced by `resolve`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("tool {0} is not supported on this host")]
    NotSupported(String),

    #[error("installing {tool} {version} failed: {reason}")]
    InstallFailed {
        tool: String,
        version: String,
        reason: String,
    },

    #[error("checksum mismatch for {tool} {version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        tool: String,
        version: String,
        expected: String,
        actual: String,
    },
}

/// Installs and memoises tool binaries per version
pub struct ToolRegistry {
    base_dir: PathBuf,
    installer: Arc<dyn ToolInstaller>,
    /// Expected sha256 digests keyed by (tool, version), when supplied
    checksums: HashMap<(String, String), String>,
    flights: SingleFlight<(String, String), Result<PathBuf, ToolError>>,
}

impl ToolRegistry {
    pub fn new(base_dir: impl Into<PathBuf>, installer: Arc<dyn ToolInstaller>) -> Self {
        Self {
            base_dir: base_dir.into(),
            installer,
            checksums: HashMap::new(),
            flights: SingleFlight::new(),
        }
    }

    /// Record an expected checksum verified before a tool is published
    pub fn with_checksum(mut self, tool: &str, version: &str, sha256: &str) -> Self {
        self.checksums
            .insert((tool.to_string(), version.to_string()), sha256.to_string());
        self
    }

    fn tool_path(&self, tool: &str, version: &str) -> PathBuf {
        self.base_dir.join(tool).join(version).join(tool)
    }

    /// Resolve the local path of a tool binary, installing it when missing.
    pub async fn resolve(&self, tool: &str, version: &str) -> Result<PathBuf, ToolError> {
        if !SUPPORTED_TOOLS.contains(&tool) {
            return Err(ToolError::NotSupported(tool.to_string()));
        }

        let key = (tool.to_string(), version.to_string());
        let path = self.tool_path(tool, version);
        let checksum = self.checksums.get(&key).cloned();
        let installer = self.installer.clone();
        let tool = tool.to_string();
        let version = version.to_string();

        self.flights
            .run(key, || async move {
                install_once(installer, &tool, &version, &path, checksum).await
            })
            .await
    }
}

/// Stage, verify and atomically publish one tool binary.
async fn install_once(
    installer: Arc<dyn ToolInstaller>,
    tool: &str,
    version: &str,
    path: &Path,
    checksum: Option<String>,
) -> Result<PathBuf, ToolError> {
    if fs::try_exists(path).await.unwrap_or(false) {
        debug!("{} {} already installed at {}", tool, version, path.display());
        return Ok(path.to_path_buf());
    }

    let install_failed = |reason: String| ToolError::InstallFailed {
        tool: tool.to_string(),
        version: version.to_string(),
        reason,
    };

    let parent = path
        .parent()
        .ok_or_else(|| install_failed("tool path has no parent directory".to_string()))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| install_failed(e.to_string()))?;

    // Stage into a sibling path; the final name only ever holds a verified
    // binary because publishing is a rename.
    let staging = parent.join(format!(".{}.partial", tool));
    info!("installing {} {}...", tool, version);
    installer
        .install(tool, version, &staging)
        .await
        .map_err(install_failed)?;

    if let Some(expected) = checksum {
        let contents = fs::read(&staging)
            .await
            .map_err(|e| install_failed(e.to_string()))?;
        let actual = sha256_hash(&contents);
        if actual != expected {
            let _ = fs::remove_file(&staging).await;
            return Err(ToolError::ChecksumMismatch {
                tool: tool.to_string(),
                version: version.to_string(),
                expected,
                actual,
            });
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&staging)
            .await
            .map_err(|e| install_failed(e.to_string()))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&staging, perms)
            .await
            .map_err(|e| install_failed(e.to_string()))?;
    }

    fs::rename(&staging, path)
        .await
        .map_err(|e| install_failed(e.to_string()))?;

    info!("installed {} {} at {}", tool, version, path.display());
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct CountingInstaller {
        installs: AtomicU32,
        fail_first: AtomicU32,
        payload: &'static [u8],
    }

    #[async_trait]
    impl ToolInstaller for CountingInstaller {
        async fn install(&self, _tool: &str, _version: &str, dest: &Path) -> Result<(), String> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
            {
                return Err("download interrupted".to_string());
            }
            tokio::fs::write(dest, self.payload)
                .await
                .map_err(|e| e.to_string())
        }
    }

    fn installer(fail_first: u32) -> Arc<CountingInstaller> {
        Arc::new(CountingInstaller {
            installs: AtomicU32::new(0),
            fail_first: AtomicU32::new(fail_first),
            payload: b"#!/bin/sh\n",
        })
    }

    #[tokio::test]
    async fn test_resolve_installs_once_and_memoises() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(0);
        let registry = ToolRegistry::new(dir.path(), installer.clone());

        let first = registry.resolve("kubectl", "1.19.0").await.unwrap();
        let second = registry.resolve("kubectl", "1.19.0").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(installer.installs.load(Ordering::SeqCst), 1);
        assert!(first.exists());
    }

    #[tokio::test]
    async fn test_failed_install_retried_on_next_call() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(1);
        let registry = ToolRegistry::new(dir.path(), installer.clone());

        let first = registry.resolve("helm", "3.4.0").await;
        assert!(matches!(first, Err(ToolError::InstallFailed { .. })));

        let second = registry.resolve("helm", "3.4.0").await;
        assert!(second.is_ok());
        assert_eq!(installer.installs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path(), installer(0));
        let result = registry.resolve("vault", "1.0.0").await;
        assert_eq!(result, Err(ToolError::NotSupported("vault".to_string())));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path(), installer(0))
            .with_checksum("terraform", "0.13.0", "not-the-digest");

        let result = registry.resolve("terraform", "0.13.0").await;
        assert!(matches!(result, Err(ToolError::ChecksumMismatch { .. })));
        // The unverified binary must not have been published.
        assert!(!dir.path().join("terraform/0.13.0/terraform").exists());
    }
}
