//! Command models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a user-initiated command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    SyncApplication,
    CancelDeployment,
    ApproveStage,
    ChainUpdate,
}

/// Result written back when a command is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResult {
    Succeeded,
    Failed,
}

/// A user-initiated request targeting an application or deployment.
///
/// Delivered at-least-once until acknowledged; handlers must be idempotent
/// with respect to the command id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,

    /// Index of the targeted stage, for APPROVE_STAGE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<u32>,

    /// User that issued the command
    pub commander: String,

    pub issued_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
}
