//! Storage layout for the agent's base directory

use std::path::PathBuf;

use crate::errors::PipedError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of everything the agent keeps under its base directory:
/// git mirrors, ephemeral checkouts, installed tools, and trigger state.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory holding one git mirror per configured repository
    pub fn repos_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("repos"))
    }

    /// Mirror directory for one repository
    pub fn repo_dir(&self, repo_id: &str) -> Dir {
        self.repos_dir().subdir(repo_id)
    }

    /// Directory holding ephemeral checkouts, keyed by (repo, commit)
    pub fn workspaces_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("workspaces"))
    }

    /// Checkout directory for one (repo, commit) pair
    pub fn workspace_dir(&self, repo_id: &str, commit: &str) -> Dir {
        self.workspaces_dir().subdir(repo_id).subdir(commit)
    }

    /// Directory holding installed tool binaries
    pub fn tools_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("tools"))
    }

    /// Directory holding persisted agent state
    pub fn state_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("state"))
    }

    /// File recording the last-triggered commit per application
    pub fn trigger_state_file(&self) -> File {
        self.state_dir().file("trigger.json")
    }

    /// SSH configuration written when a git ssh key is configured
    pub fn ssh_config_file(&self) -> File {
        File::new(self.base_dir.join(".ssh").join("config"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), PipedError> {
        self.repos_dir().create().await?;
        self.workspaces_dir().create().await?;
        self.tools_dir().create().await?;
        self.state_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/piped");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::temp_dir().join("piped");

        Self::new(base_dir)
    }
}
