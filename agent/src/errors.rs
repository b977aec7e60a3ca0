//! Error types for the piped agent

use thiserror::Error;

use crate::toolregistry::ToolError;

/// Main error type for the piped agent
#[derive(Error, Debug)]
pub enum PipedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Deployment error: {0}")]
    Deployment(String),

    #[error("Stage {0} is already registered")]
    AlreadyRegistered(String),

    #[error("No registered executor for stage {0}")]
    UnknownStage(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Secret error: {0}")]
    Secret(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipedError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipedError::Http(_) | PipedError::Api(_) | PipedError::Git(_) | PipedError::Io(_)
        )
    }
}
