//! WAIT stage: hold the pipeline for a configured duration

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::executor::{ExecutionOutcome, Input, StageExecutor};

const DEFAULT_WAIT_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WaitStageConfig {
    duration_secs: u64,
}

impl Default for WaitStageConfig {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_WAIT_SECS,
        }
    }
}

#[derive(Debug)]
pub struct WaitExecutor;

#[async_trait]
impl StageExecutor for WaitExecutor {
    async fn execute(&self, input: Input) -> ExecutionOutcome {
        let config: WaitStageConfig = match serde_json::from_value(input.stage.config.clone()) {
            Ok(config) => config,
            Err(_) if input.stage.config.is_null() => WaitStageConfig::default(),
            Err(e) => return ExecutionOutcome::failure(format!("invalid wait config: {}", e)),
        };

        let duration = Duration::from_secs(config.duration_secs);
        input
            .logs
            .info(format!("waiting {}s before continuing...", config.duration_secs))
            .await;

        let mut cancel = input.cancel;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                input.logs.success("wait finished").await;
                ExecutionOutcome::Success
            }
            _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
        }
    }
}
