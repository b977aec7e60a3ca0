//! Sealed-secret decryption seam.
//!
//! The agent only needs decrypt-over-opaque-bytes at render time; the
//! concrete primitive is selected by the sealed-secret management config.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::piped::SealedSecretManagement;
use crate::errors::PipedError;

/// Decrypts sealed-secret ciphertext at manifest render time
#[async_trait]
pub trait SecretDecrypter: Send + Sync {
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PipedError>;
}

/// Build the decrypter selected by configuration, if any
pub fn decrypter_for(
    config: Option<&SealedSecretManagement>,
) -> Result<Option<Arc<dyn SecretDecrypter>>, PipedError> {
    match config {
        None => Ok(None),
        Some(SealedSecretManagement::SealingKey {
            private_key_file, ..
        }) => Ok(Some(Arc::new(SealingKeyDecrypter {
            private_key_file: private_key_file.clone(),
        }))),
        Some(SealedSecretManagement::GcpKms { .. }) => Err(PipedError::Config(
            "GCP_KMS sealed secret management is not supported by this build".to_string(),
        )),
    }
}

/// RSA decryption against the configured sealing key, via openssl
pub struct SealingKeyDecrypter {
    private_key_file: PathBuf,
}

#[async_trait]
impl SecretDecrypter for SealingKeyDecrypter {
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PipedError> {
        let key = self.private_key_file.to_string_lossy();
        let mut child = Command::new("openssl")
            .args(["pkeyutl", "-decrypt", "-inkey", &key])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipedError::Secret(format!("failed to run openssl: {}", e)))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(ciphertext)
                .await
                .map_err(|e| PipedError::Secret(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PipedError::Secret(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipedError::Secret(format!(
                "decryption failed: {}",
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}
