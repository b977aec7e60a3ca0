//! Git subprocess client

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::errors::PipedError;

/// Thin wrapper over the `git` binary.
///
/// All operations are plain subprocess invocations; callers serialise
/// mutating operations per repository.
#[derive(Debug, Clone)]
pub struct GitClient {
    username: String,
    email: String,
    ssh_command: Option<String>,
}

impl GitClient {
    pub fn new(username: &str, email: &str, ssh_key_file: Option<&Path>) -> Self {
        let ssh_command = ssh_key_file.map(|key| {
            format!(
                "ssh -i {} -o StrictHostKeyChecking=no -F /dev/null",
                key.display()
            )
        });
        Self {
            username: username.to_string(),
            email: email.to_string(),
            ssh_command,
        }
    }

    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, PipedError> {
        debug!("git {}", args.join(" "));

        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_AUTHOR_NAME", &self.username)
            .env("GIT_AUTHOR_EMAIL", &self.email)
            .env("GIT_COMMITTER_NAME", &self.username)
            .env("GIT_COMMITTER_EMAIL", &self.email)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ssh) = &self.ssh_command {
            cmd.env("GIT_SSH_COMMAND", ssh);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| PipedError::Git(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipedError::Git(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Create a bare mirror of a remote repository
    pub async fn clone_mirror(&self, remote: &str, dest: &Path) -> Result<(), PipedError> {
        let dest_str = dest.to_string_lossy();
        self.run(&["clone", "--mirror", remote, &dest_str], None)
            .await?;
        Ok(())
    }

    /// Update a mirror from its remote
    pub async fn fetch(&self, mirror: &Path) -> Result<(), PipedError> {
        self.run(&["fetch", "--prune", "origin"], Some(mirror))
            .await?;
        Ok(())
    }

    /// Resolve a branch to its head commit in a mirror
    pub async fn rev_parse(&self, mirror: &Path, branch: &str) -> Result<String, PipedError> {
        let out = self.run(&["rev-parse", branch], Some(mirror)).await?;
        Ok(out.trim().to_string())
    }

    /// Clone a working tree from a local mirror and check out a commit
    pub async fn checkout_from_mirror(
        &self,
        mirror: &Path,
        commit: &str,
        dest: &Path,
    ) -> Result<(), PipedError> {
        let mirror_str = mirror.to_string_lossy();
        let dest_str = dest.to_string_lossy();
        self.run(
            &["clone", "--no-checkout", &mirror_str, &dest_str],
            None,
        )
        .await?;
        self.run(&["checkout", "--detach", commit], Some(dest))
            .await?;
        Ok(())
    }

    /// Paths changed between two commits
    pub async fn changed_files(
        &self,
        mirror: &Path,
        from: &str,
        to: &str,
    ) -> Result<Vec<String>, PipedError> {
        let range = format!("{}..{}", from, to);
        let out = self
            .run(&["diff", "--name-only", &range], Some(mirror))
            .await?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    /// Contents of a file at a commit, or None when the path does not exist
    pub async fn cat_file(
        &self,
        mirror: &Path,
        commit: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, PipedError> {
        let spec = format!("{}:{}", commit, path);
        match self.run(&["show", &spec], Some(mirror)).await {
            Ok(out) => Ok(Some(out.into_bytes())),
            Err(PipedError::Git(reason))
                if reason.contains("does not exist") || reason.contains("exists on disk") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
