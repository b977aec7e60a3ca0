//! SYNC stage: make the target environment match the manifests at the
//! trigger commit.

use async_trait::async_trait;

use crate::executor::{ExecutionOutcome, Input, StageExecutor};

#[derive(Debug)]
pub struct SyncExecutor;

#[async_trait]
impl StageExecutor for SyncExecutor {
    async fn execute(&self, input: Input) -> ExecutionOutcome {
        let Some(provider) = input.provider.clone() else {
            return ExecutionOutcome::failure(format!(
                "no provider registered as {}",
                input.app_config.cloud_provider
            ));
        };

        if input.cancel.is_cancelled() {
            return ExecutionOutcome::Cancelled;
        }

        let app_dir = input.target_app_dir();
        input
            .logs
            .info(format!(
                "syncing {} to {}...",
                input.application.path, input.deployment.trigger.commit_to
            ))
            .await;

        let mut cancel = input.cancel.clone();
        let apply = provider.apply(&input.application, &app_dir, &input.logs);
        tokio::select! {
            result = apply => match result {
                Ok(()) => {
                    input.logs.success("sync finished").await;
                    ExecutionOutcome::Success
                }
                // Apply races and transient provider errors are worth a
                // retry within the stage's budget.
                Err(e) => ExecutionOutcome::retryable_failure(e.to_string()),
            },
            _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
        }
    }
}
