//! Deployment and stage models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::application::ApplicationKind;

/// Status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Planned,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// Legal forward transitions; terminal states are never left.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, next) {
            (Pending, Planned) | (Pending, Failure) | (Pending, Cancelled) => true,
            (Planned, Running) | (Planned, Failure) | (Planned, Cancelled) => true,
            (Running, Success) | (Running, Failure) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }

    /// A stage only moves forward: NOT_STARTED -> RUNNING -> one terminal
    /// value, or straight to SKIPPED/CANCELLED before it ever starts.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        use StageStatus::*;
        match (self, next) {
            (NotStarted, Running) | (NotStarted, Skipped) | (NotStarted, Cancelled) => true,
            (Running, Success) | (Running, Failure) | (Running, Cancelled) => true,
            // An executor may exit with skip instead of running to completion.
            (Running, Skipped) => true,
            _ => false,
        }
    }
}

/// The closed set of stage kinds; each names a registered executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Wait,
    WaitApproval,
    Analysis,
    Sync,
    TerraformPlan,
    TerraformApply,
    Rollback,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "WAIT",
            Self::WaitApproval => "WAIT_APPROVAL",
            Self::Analysis => "ANALYSIS",
            Self::Sync => "SYNC",
            Self::TerraformPlan => "TERRAFORM_PLAN",
            Self::TerraformApply => "TERRAFORM_APPLY",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StageKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "WAIT" => Ok(Self::Wait),
            "WAIT_APPROVAL" => Ok(Self::WaitApproval),
            "ANALYSIS" => Ok(Self::Analysis),
            "SYNC" => Ok(Self::Sync),
            "TERRAFORM_PLAN" => Ok(Self::TerraformPlan),
            "TERRAFORM_APPLY" => Ok(Self::TerraformApply),
            "ROLLBACK" => Ok(Self::Rollback),
            _ => Err(format!("Unknown stage kind: {}", s)),
        }
    }
}

/// A node in a deployment's pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Ordinal within the deployment
    pub index: u32,

    /// Names the executor that runs this stage
    pub kind: StageKind,

    /// Indices of predecessor stages; empty means no predecessors
    pub requires: Vec<u32>,

    /// Stage configuration blob, interpreted by the executor
    #[serde(default)]
    pub config: serde_json::Value,

    /// Maximum retries after a retryable failure
    #[serde(default)]
    pub retry_limit: u32,

    /// Overall stage timeout in seconds
    pub timeout_secs: u64,

    pub status: StageStatus,

    /// Number of retries performed so far
    #[serde(default)]
    pub retried_count: u32,

    #[serde(default)]
    pub status_reason: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// What caused a deployment to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    Scheduled,
    Command,
    ImageUpdate,
    Drift,
}

/// The commit range and provenance of a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTrigger {
    /// Commit the application is currently running, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_from: Option<String>,

    /// Commit the deployment moves the application to
    pub commit_to: String,

    pub source: TriggerSource,

    /// User that issued the command, for command-triggered deployments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commander: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// An intent to move an application from one commit to another.
///
/// Immutable once created except for status fields and per-stage status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    pub project_id: String,

    /// The piped instance this deployment is assigned to
    pub piped_id: String,

    pub repo_id: String,

    /// Directory path of the application inside the repository
    pub app_path: String,

    pub kind: ApplicationKind,

    pub trigger: DeploymentTrigger,

    /// The planned pipeline; empty until planning completes
    #[serde(default)]
    pub stages: Vec<Stage>,

    pub status: DeploymentStatus,

    #[serde(default)]
    pub status_reason: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn stage(&self, index: u32) -> Option<&Stage> {
        self.stages.iter().find(|s| s.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_forward_only() {
        use StageStatus::*;

        assert!(NotStarted.can_transition_to(Running));
        assert!(NotStarted.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failure));
        assert!(Running.can_transition_to(Cancelled));

        assert!(Running.can_transition_to(Skipped));

        // No backward or out-of-terminal transitions.
        assert!(!Running.can_transition_to(NotStarted));
        assert!(!Success.can_transition_to(Running));
        assert!(!Failure.can_transition_to(Success));
        assert!(!Skipped.can_transition_to(Running));
    }

    #[test]
    fn test_deployment_status_terminal() {
        assert!(DeploymentStatus::Success.is_terminal());
        assert!(DeploymentStatus::Failure.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
        assert!(!DeploymentStatus::Running.is_terminal());
        assert!(!DeploymentStatus::Pending.is_terminal());
    }

    #[test]
    fn test_stage_kind_roundtrip() {
        assert_eq!(StageKind::try_from("WAIT_APPROVAL"), Ok(StageKind::WaitApproval));
        assert_eq!(StageKind::Sync.as_str(), "SYNC");
        assert!(StageKind::try_from("CUSTOM").is_err());
    }
}
