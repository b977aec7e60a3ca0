//! Checkout workspace pool.
//!
//! Mirrors live under `repos/<repo_id>/`, working trees under
//! `workspaces/<repo_id>/<commit>/`. Git mutates working-tree state, so all
//! operations on one repository are serialised behind a per-repo lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::piped::Repository;
use crate::errors::PipedError;
use crate::git::client::GitClient;
use crate::storage::layout::StorageLayout;

/// Options for the workspace pool
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    /// Maximum retained checkouts per repository before LRU eviction
    pub max_checkouts_per_repo: usize,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            max_checkouts_per_repo: 16,
        }
    }
}

/// A leased working tree at one commit. Pinned until released back to the
/// pool with [`GitWorkspaces::release`].
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub repo_id: String,
    pub commit: String,
    pub path: PathBuf,
}

struct CheckoutEntry {
    path: PathBuf,
    pins: usize,
    last_used: Instant,
}

struct RepoState {
    config: Repository,
    mirror: PathBuf,
    /// Retained checkouts keyed by commit
    checkouts: HashMap<String, CheckoutEntry>,
}

/// Clones, caches, and checks out commits for each configured repository
pub struct GitWorkspaces {
    layout: StorageLayout,
    client: GitClient,
    options: WorkspaceOptions,
    /// One lock per repository, held across every git mutation
    repos: HashMap<String, Arc<Mutex<RepoState>>>,
}

impl GitWorkspaces {
    pub fn new(
        layout: StorageLayout,
        client: GitClient,
        repositories: &[Repository],
        options: WorkspaceOptions,
    ) -> Self {
        let repos = repositories
            .iter()
            .map(|repo| {
                let state = RepoState {
                    config: repo.clone(),
                    mirror: layout.repo_dir(&repo.repo_id).path().to_path_buf(),
                    checkouts: HashMap::new(),
                };
                (repo.repo_id.clone(), Arc::new(Mutex::new(state)))
            })
            .collect();
        Self {
            layout,
            client,
            options,
            repos,
        }
    }

    pub fn client(&self) -> &GitClient {
        &self.client
    }

    fn repo(&self, repo_id: &str) -> Result<Arc<Mutex<RepoState>>, PipedError> {
        self.repos
            .get(repo_id)
            .cloned()
            .ok_or_else(|| PipedError::NotFound(format!("repository {}", repo_id)))
    }

    /// Path of a repository's mirror, for read-only plumbing such as
    /// `changed_files`. The mirror exists after the first `clone_or_fetch`.
    pub async fn mirror_path(&self, repo_id: &str) -> Result<PathBuf, PipedError> {
        let repo = self.repo(repo_id)?;
        let state = repo.lock().await;
        Ok(state.mirror.clone())
    }

    /// Ensure the local mirror exists and is up to date with the remote;
    /// returns the head commit of the configured branch.
    pub async fn clone_or_fetch(&self, repo_id: &str) -> Result<String, PipedError> {
        let repo = self.repo(repo_id)?;
        let state = repo.lock().await;

        if fs::try_exists(&state.mirror).await.unwrap_or(false) {
            debug!("fetching {}...", repo_id);
            self.client.fetch(&state.mirror).await?;
        } else {
            info!("cloning mirror of {}...", repo_id);
            self.client
                .clone_mirror(&state.config.remote, &state.mirror)
                .await?;
        }

        self.client
            .rev_parse(&state.mirror, &state.config.branch)
            .await
    }

    /// Produce an isolated working tree at the requested commit, reusing a
    /// pooled checkout of the same commit when one is free.
    pub async fn checkout(
        &self,
        repo_id: &str,
        commit: &str,
    ) -> Result<WorkspaceHandle, PipedError> {
        let repo = self.repo(repo_id)?;
        let mut state = repo.lock().await;

        if let Some(entry) = state.checkouts.get_mut(commit) {
            entry.pins += 1;
            entry.last_used = Instant::now();
            return Ok(WorkspaceHandle {
                repo_id: repo_id.to_string(),
                commit: commit.to_string(),
                path: entry.path.clone(),
            });
        }

        let dest = self
            .layout
            .workspace_dir(repo_id, commit)
            .path()
            .to_path_buf();
        if fs::try_exists(&dest).await.unwrap_or(false) {
            // A previous run left the tree behind; discard and recreate so
            // the checkout is known-clean.
            fs::remove_dir_all(&dest).await?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        if !fs::try_exists(&state.mirror).await.unwrap_or(false) {
            info!("cloning mirror of {}...", repo_id);
            self.client
                .clone_mirror(&state.config.remote, &state.mirror)
                .await?;
        }

        // The commit may postdate the mirror (reclaim after restart); fetch
        // once and retry before giving up.
        if let Err(first) = self
            .client
            .checkout_from_mirror(&state.mirror, commit, &dest)
            .await
        {
            debug!("checkout of {} failed ({}), fetching and retrying", commit, first);
            let _ = fs::remove_dir_all(&dest).await;
            self.client.fetch(&state.mirror).await?;
            self.client
                .checkout_from_mirror(&state.mirror, commit, &dest)
                .await?;
        }

        state.checkouts.insert(
            commit.to_string(),
            CheckoutEntry {
                path: dest.clone(),
                pins: 1,
                last_used: Instant::now(),
            },
        );

        self.evict_lru(&mut state).await;

        Ok(WorkspaceHandle {
            repo_id: repo_id.to_string(),
            commit: commit.to_string(),
            path: dest,
        })
    }

    /// Return a working tree to the pool for reuse or eviction
    pub async fn release(&self, handle: WorkspaceHandle) {
        let Ok(repo) = self.repo(&handle.repo_id) else {
            return;
        };
        let mut state = repo.lock().await;
        if let Some(entry) = state.checkouts.get_mut(&handle.commit) {
            entry.pins = entry.pins.saturating_sub(1);
            entry.last_used = Instant::now();
        }
        self.evict_lru(&mut state).await;
    }

    /// Delete least-recently-used unpinned checkouts beyond the cap
    async fn evict_lru(&self, state: &mut RepoState) {
        while state.checkouts.len() > self.options.max_checkouts_per_repo {
            let victim = state
                .checkouts
                .iter()
                .filter(|(_, e)| e.pins == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(commit, _)| commit.clone());

            let Some(commit) = victim else {
                // Everything is pinned; nothing to evict.
                return;
            };
            if let Some(entry) = state.checkouts.remove(&commit) {
                debug!("evicting checkout {}", entry.path.display());
                if let Err(e) = fs::remove_dir_all(&entry.path).await {
                    warn!("failed to evict checkout {}: {}", entry.path.display(), e);
                }
            }
        }
    }
}
