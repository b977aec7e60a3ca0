//! ROLLBACK stage: re-apply the manifests of the commit that was running
//! before this deployment started.

use async_trait::async_trait;

use crate::executor::{ExecutionOutcome, Input, StageExecutor};

#[derive(Debug)]
pub struct RollbackExecutor;

#[async_trait]
impl StageExecutor for RollbackExecutor {
    async fn execute(&self, input: Input) -> ExecutionOutcome {
        let Some(provider) = input.provider.clone() else {
            return ExecutionOutcome::failure(format!(
                "no provider registered as {}",
                input.app_config.cloud_provider
            ));
        };

        let Some(app_dir) = input.running_app_dir() else {
            // Nothing was running before; there is no state to restore.
            input
                .logs
                .info("no previously running commit; nothing to roll back")
                .await;
            return ExecutionOutcome::Skipped;
        };

        let commit = input
            .deployment
            .trigger
            .commit_from
            .clone()
            .unwrap_or_default();
        input
            .logs
            .info(format!("rolling back to {}...", commit))
            .await;

        let mut cancel = input.cancel.clone();
        let apply = provider.apply(&input.application, &app_dir, &input.logs);
        tokio::select! {
            result = apply => match result {
                Ok(()) => {
                    input.logs.success("rollback finished").await;
                    ExecutionOutcome::Success
                }
                Err(e) => ExecutionOutcome::failure(e.to_string()),
            },
            _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
        }
    }
}
