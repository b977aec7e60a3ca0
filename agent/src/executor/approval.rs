//! WAIT_APPROVAL stage: block until an APPROVE_STAGE command arrives.
//!
//! Timeout elapsed without approval fails the stage.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::executor::{ExecutionOutcome, Input, StageExecutor};

const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ApprovalStageConfig {
    timeout_secs: u64,

    /// Informational; enforcement of who may approve happens control-plane
    /// side before the command reaches this piped.
    approvers: Vec<String>,
}

impl Default for ApprovalStageConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            approvers: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct WaitApprovalExecutor;

#[async_trait]
impl StageExecutor for WaitApprovalExecutor {
    async fn execute(&self, input: Input) -> ExecutionOutcome {
        let config: ApprovalStageConfig = match serde_json::from_value(input.stage.config.clone())
        {
            Ok(config) => config,
            Err(_) if input.stage.config.is_null() => ApprovalStageConfig::default(),
            Err(e) => return ExecutionOutcome::failure(format!("invalid approval config: {}", e)),
        };

        if config.approvers.is_empty() {
            input.logs.info("waiting for approval...").await;
        } else {
            input
                .logs
                .info(format!("waiting for approval from {}...", config.approvers.join(", ")))
                .await;
        }

        let timeout = Duration::from_secs(config.timeout_secs);
        let mut cancel = input.cancel;
        tokio::select! {
            _ = input.approvals.wait_for(input.stage.index) => {
                input.logs.success("stage approved").await;
                ExecutionOutcome::Success
            }
            _ = tokio::time::sleep(timeout) => {
                input
                    .logs
                    .error(format!("no approval within {}s", config.timeout_secs))
                    .await;
                ExecutionOutcome::failure("approval timed out")
            }
            _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
        }
    }
}
