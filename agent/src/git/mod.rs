//! Git plumbing: subprocess client and the checkout workspace pool

pub mod client;
pub mod workspace;

pub use client::GitClient;
pub use workspace::{GitWorkspaces, WorkspaceHandle, WorkspaceOptions};
