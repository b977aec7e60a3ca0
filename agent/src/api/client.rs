//! The API the agent consumes from the control plane.
//!
//! The deployment engine talks to this trait only; the HTTP binding lives in
//! [`crate::api::http`] and tests substitute an in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipedError;
use crate::model::application::{Application, ApplicationKind, ApplicationSyncState};
use crate::model::command::{Command, CommandResult};
use crate::model::deployment::{
    Deployment, DeploymentStatus, DeploymentTrigger, Stage, StageStatus,
};
use crate::model::livestate::ApplicationLiveState;

/// Severity of one stage log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Info,
    Success,
    Error,
}

/// One stage log line forwarded to the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBlock {
    /// Sequence number within the deployment's event stream
    pub index: u64,
    pub severity: LogSeverity,
    pub log: String,
    pub created_at: DateTime<Utc>,
}

/// Resource snapshot reported with each ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipedStat {
    pub piped_id: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub cpu_count: usize,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Request to create a deployment for an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub application_id: String,
    pub repo_id: String,
    pub app_path: String,
    pub kind: ApplicationKind,
    pub trigger: DeploymentTrigger,
}

/// Client surface of the control-plane API.
///
/// Every call carries a deadline inside the implementation; callers treat
/// errors as transient and retry with their own budgets.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn ping(&self, stat: PipedStat) -> Result<(), PipedError>;

    async fn list_applications(&self) -> Result<Vec<Application>, PipedError>;

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: ApplicationSyncState,
    ) -> Result<(), PipedError>;

    async fn report_application_live_state(
        &self,
        state: ApplicationLiveState,
    ) -> Result<(), PipedError>;

    /// Deployments assigned to this piped that have not reached a terminal
    /// status, including reclaimable ones from a previous run.
    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError>;

    /// Persist the planned pipeline before any stage runs.
    async fn report_deployment_planned(
        &self,
        deployment_id: &str,
        stages: Vec<Stage>,
        status_reason: &str,
    ) -> Result<(), PipedError>;

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        status_reason: &str,
        seq: u64,
    ) -> Result<(), PipedError>;

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_index: u32,
        status: StageStatus,
        status_reason: &str,
        retried_count: u32,
        seq: u64,
    ) -> Result<(), PipedError>;

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_index: u32,
        blocks: Vec<LogBlock>,
    ) -> Result<(), PipedError>;

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError>;

    async fn report_command_handled(
        &self,
        command_id: &str,
        result: CommandResult,
        output: Vec<u8>,
    ) -> Result<(), PipedError>;

    /// Returns the id of the created deployment.
    async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
    ) -> Result<String, PipedError>;
}
