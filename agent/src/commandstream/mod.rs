//! Command stream handling.
//!
//! Commands are pulled from the API by the command-stream worker and routed
//! here by kind. Delivery is at-least-once, so handling is idempotent with
//! respect to the command id; acknowledgement happens by reporting the
//! command handled with its result.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::client::ApiClient;
use crate::controller::Scheduler;
use crate::errors::PipedError;
use crate::model::command::{Command, CommandKind, CommandResult};
use crate::trigger::DeploymentTrigger;

/// Routes commands to their handlers and acknowledges them
pub struct CommandProcessor {
    api: Arc<dyn ApiClient>,
    scheduler: Arc<Scheduler>,
    trigger: Arc<DeploymentTrigger>,
    /// Ids handled in this process; re-deliveries are acked without rerun
    handled: Mutex<HashSet<String>>,
}

impl CommandProcessor {
    pub fn new(
        api: Arc<dyn ApiClient>,
        scheduler: Arc<Scheduler>,
        trigger: Arc<DeploymentTrigger>,
    ) -> Self {
        Self {
            api,
            scheduler,
            trigger,
            handled: Mutex::new(HashSet::new()),
        }
    }

    /// Handle one command and acknowledge it
    pub async fn process(&self, command: Command) -> Result<(), PipedError> {
        {
            let mut handled = self.handled.lock().await;
            if handled.contains(&command.id) {
                // A redelivery of something this process already ran; just
                // re-acknowledge.
                info!("command {} already handled, re-acking", command.id);
                self.api
                    .report_command_handled(&command.id, CommandResult::Succeeded, Vec::new())
                    .await?;
                return Ok(());
            }
            handled.insert(command.id.clone());
        }

        info!("handling command {} ({:?})", command.id, command.kind);
        let outcome = self.dispatch(&command).await;

        let (result, output) = match outcome {
            Ok(()) => (CommandResult::Succeeded, Vec::new()),
            Err(e) => {
                warn!("command {} failed: {}", command.id, e);
                (CommandResult::Failed, e.to_string().into_bytes())
            }
        };

        self.api
            .report_command_handled(&command.id, result, output)
            .await
    }

    async fn dispatch(&self, command: &Command) -> Result<(), PipedError> {
        match command.kind {
            CommandKind::SyncApplication => {
                let application_id = command
                    .application_id
                    .as_deref()
                    .ok_or_else(|| PipedError::Command("sync command without application".to_string()))?;
                self.trigger
                    .trigger_sync(application_id, &command.commander)
                    .await
            }
            CommandKind::CancelDeployment => {
                let deployment_id = command
                    .deployment_id
                    .as_deref()
                    .ok_or_else(|| PipedError::Command("cancel command without deployment".to_string()))?;
                if self.scheduler.cancel(deployment_id).await {
                    Ok(())
                } else {
                    Err(PipedError::NotFound(format!(
                        "deployment {} is not running here",
                        deployment_id
                    )))
                }
            }
            CommandKind::ApproveStage => {
                let deployment_id = command
                    .deployment_id
                    .as_deref()
                    .ok_or_else(|| PipedError::Command("approve command without deployment".to_string()))?;
                let stage_index = command
                    .stage_index
                    .ok_or_else(|| PipedError::Command("approve command without stage index".to_string()))?;
                if self.scheduler.approve(deployment_id, stage_index).await {
                    Ok(())
                } else {
                    Err(PipedError::NotFound(format!(
                        "deployment {} is not running here",
                        deployment_id
                    )))
                }
            }
            CommandKind::ChainUpdate => {
                let deployment_id = command
                    .deployment_id
                    .as_deref()
                    .ok_or_else(|| PipedError::Command("chain update without deployment".to_string()))?;
                if self.scheduler.request_chain_update(deployment_id).await {
                    Ok(())
                } else {
                    Err(PipedError::NotFound(format!(
                        "deployment {} is not running here",
                        deployment_id
                    )))
                }
            }
        }
    }
}
