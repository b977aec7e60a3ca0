//! Per-deployment driver: plan, execute, react, report.
//!
//! One driver runs a deployment from the status the API handed down to a
//! terminal status. Stage transitions are totally ordered here; everything
//! observable leaves through the progress reporter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cancel::{CancelHandle, Cancellation};
use crate::config::app::{ApplicationConfig, APPLICATION_CONFIG_FILENAME};
use crate::controller::DriverContext;
use crate::errors::PipedError;
use crate::executor::{ApprovalGate, ExecutionOutcome, Input};
use crate::git::WorkspaceHandle;
use crate::model::application::Application;
use crate::model::deployment::{Deployment, DeploymentStatus, StageStatus};
use crate::planner;
use crate::reporter::ProgressEvent;
use crate::utils::calc_exp_backoff;

/// Run one deployment to a terminal status.
pub async fn run(
    ctx: DriverContext,
    mut deployment: Deployment,
    cancel: Cancellation,
    approvals: Arc<ApprovalGate>,
    chain_update: Arc<AtomicBool>,
) {
    let deployment_id = deployment.id.clone();

    match run_impl(&ctx, &mut deployment, cancel, approvals, chain_update).await {
        Ok(status) => {
            info!("deployment {} finished as {:?}", deployment_id, status);
        }
        Err(e) if e.is_transient() => {
            // Leave the deployment non-terminal; the scheduler re-reclaims
            // it on a later tick and resumes from the persisted plan.
            error!(
                "driver for {} hit a transient error, will retry: {}",
                deployment_id, e
            );
        }
        Err(e) => {
            error!("deployment {} failed before execution: {}", deployment_id, e);
            set_deployment_status(
                &ctx,
                &mut deployment,
                DeploymentStatus::Failure,
                &e.to_string(),
            )
            .await;
        }
    }

    // Drain this deployment's progress queue before the driver goes away.
    ctx.reporter.finish(&deployment_id).await;
}

async fn run_impl(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    cancel: Cancellation,
    approvals: Arc<ApprovalGate>,
    chain_update: Arc<AtomicBool>,
) -> Result<DeploymentStatus, PipedError> {
    // ---------------------------------- Plan ---------------------------------- //

    let target_ws = ctx
        .workspaces
        .checkout(&deployment.repo_id, &deployment.trigger.commit_to)
        .await?;

    let running_ws = match &deployment.trigger.commit_from {
        Some(commit) => match ctx.workspaces.checkout(&deployment.repo_id, commit).await {
            Ok(ws) => Some(ws),
            Err(e) => {
                // The old commit may have been garbage collected; planning
                // proceeds against the target commit alone.
                warn!("checkout of running commit {} failed: {}", commit, e);
                None
            }
        },
        None => None,
    };

    let result = drive(
        ctx,
        deployment,
        &target_ws,
        running_ws.as_ref(),
        cancel,
        approvals,
        chain_update,
    )
    .await;

    if let Some(ws) = running_ws {
        ctx.workspaces.release(ws).await;
    }
    ctx.workspaces.release(target_ws).await;

    result
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    target_ws: &WorkspaceHandle,
    running_ws: Option<&WorkspaceHandle>,
    mut cancel: Cancellation,
    approvals: Arc<ApprovalGate>,
    chain_update: Arc<AtomicBool>,
) -> Result<DeploymentStatus, PipedError> {
    let config_path = target_ws
        .path
        .join(&deployment.app_path)
        .join(APPLICATION_CONFIG_FILENAME);
    let contents = tokio::fs::read_to_string(&config_path)
        .await
        .map_err(|e| {
            PipedError::Config(format!(
                "application config missing at {}: {}",
                config_path.display(),
                e
            ))
        })?;
    let app_config = ApplicationConfig::parse(&contents)?;

    let application = lookup_application(ctx, deployment, &app_config);

    if deployment.stages.is_empty() {
        let plan = planner::build_plan(&app_config)?;
        deployment.stages = plan.stages;
        persist_plan(ctx, deployment, &plan.summary).await?;
        set_deployment_status(ctx, deployment, DeploymentStatus::Planned, &plan.summary).await;
    } else {
        info!(
            "resuming deployment {} from its persisted plan ({} stages)",
            deployment.id,
            deployment.stages.len()
        );
        // A stage interrupted mid-run is re-executed from scratch.
        for stage in deployment.stages.iter_mut() {
            if stage.status == StageStatus::Running {
                stage.status = StageStatus::NotStarted;
            }
        }
    }

    set_deployment_status(ctx, deployment, DeploymentStatus::Running, "executing stages").await;

    // -------------------------------- Execute --------------------------------- //

    let mut inflight: JoinSet<(u32, ExecutionOutcome, u32)> = JoinSet::new();
    let mut stage_cancels: HashMap<u32, CancelHandle> = HashMap::new();
    // Skips caused by a failed or cancelled predecessor propagate to their
    // successors; voluntary executor skips satisfy successors instead.
    let mut poisoned_skips: HashSet<u32> = HashSet::new();
    let mut cancel_observed = false;
    let mut aborting = false;

    loop {
        if cancel.is_cancelled() && !cancel_observed {
            cancel_observed = true;
            aborting = true;
            for handle in stage_cancels.values() {
                handle.cancel();
            }
            skip_unstarted(ctx, deployment, &mut poisoned_skips).await;
        }

        if !aborting && chain_update.swap(false, Ordering::SeqCst) {
            if let Err(e) = apply_chain_update(ctx, deployment).await {
                warn!("chain update for {} not applied: {}", deployment.id, e);
            }
        }

        if !aborting {
            cascade_skips(ctx, deployment, &mut poisoned_skips).await;
            dispatch_ready(
                ctx,
                deployment,
                target_ws,
                running_ws,
                &app_config,
                &application,
                &approvals,
                &mut inflight,
                &mut stage_cancels,
                &poisoned_skips,
            )
            .await;
        }

        if deployment.stages.iter().all(|s| s.status.is_terminal()) {
            break;
        }

        if inflight.is_empty() {
            // Nothing running and nothing became ready: the remaining
            // stages can never start. Guard against an unsatisfiable plan.
            error!("deployment {} has unrunnable stages", deployment.id);
            skip_unstarted(ctx, deployment, &mut poisoned_skips).await;
            break;
        }

        tokio::select! {
            Some(joined) = inflight.join_next() => {
                let (index, outcome, retried) = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!("stage task for {} aborted: {}", deployment.id, e);
                        continue;
                    }
                };
                stage_cancels.remove(&index);
                react(ctx, deployment, index, outcome, retried, &mut aborting, &stage_cancels, &mut poisoned_skips).await;
            }
            _ = cancel.cancelled(), if !cancel_observed => {
                // Handled at the top of the loop.
            }
        }
    }

    // --------------------------------- Report --------------------------------- //

    let (status, reason) = terminal_status(deployment, cancel_observed);
    set_deployment_status(ctx, deployment, status, &reason).await;
    Ok(status)
}

/// Resolve the application record, falling back to the deployment's own
/// fields when the store has not scanned this repo yet (fresh restart).
fn lookup_application(
    ctx: &DriverContext,
    deployment: &Deployment,
    app_config: &ApplicationConfig,
) -> Application {
    ctx.appstore
        .get(&deployment.application_id)
        .unwrap_or_else(|| Application {
            id: deployment.application_id.clone(),
            project_id: deployment.project_id.clone(),
            kind: deployment.kind,
            repo_id: deployment.repo_id.clone(),
            path: deployment.app_path.clone(),
            cloud_provider: app_config.cloud_provider.clone(),
            config: Some(app_config.clone()),
            config_error: None,
            config_digest: String::new(),
            latest_deployment_id: Some(deployment.id.clone()),
            disabled: false,
            updated_at: Utc::now(),
        })
}

/// Persist the plan via the API before any stage runs.
async fn persist_plan(
    ctx: &DriverContext,
    deployment: &Deployment,
    summary: &str,
) -> Result<(), PipedError> {
    let mut attempt = 0u32;
    loop {
        match ctx
            .api
            .report_deployment_planned(&deployment.id, deployment.stages.clone(), summary)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 < ctx.options.api_retry_attempts => {
                let delay = calc_exp_backoff(&ctx.options.api_cooldown, attempt);
                warn!(
                    "persisting plan for {} failed (attempt {}): {}; retrying in {:?}",
                    deployment.id, attempt, e, delay
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Mark stages whose predecessors failed as SKIPPED, transitively.
async fn cascade_skips(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    poisoned: &mut HashSet<u32>,
) {
    loop {
        let mut victim = None;
        for stage in &deployment.stages {
            if stage.status != StageStatus::NotStarted {
                continue;
            }
            let blocked = stage.requires.iter().any(|required| {
                deployment
                    .stages
                    .iter()
                    .find(|s| s.index == *required)
                    .map(|s| {
                        matches!(s.status, StageStatus::Failure | StageStatus::Cancelled)
                            || (s.status == StageStatus::Skipped && poisoned.contains(&s.index))
                    })
                    .unwrap_or(true)
            });
            if blocked {
                victim = Some(stage.index);
                break;
            }
        }

        let Some(index) = victim else { return };
        poisoned.insert(index);
        set_stage_status(ctx, deployment, index, StageStatus::Skipped, "predecessor did not succeed", None).await;
    }
}

/// Skip every stage that has not started; used on cancellation and abort.
async fn skip_unstarted(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    poisoned: &mut HashSet<u32>,
) {
    let indices: Vec<u32> = deployment
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::NotStarted)
        .map(|s| s.index)
        .collect();
    for index in indices {
        poisoned.insert(index);
        set_stage_status(ctx, deployment, index, StageStatus::Skipped, "deployment aborted", None).await;
    }
}

/// Start every stage whose predecessors are satisfied.
#[allow(clippy::too_many_arguments)]
async fn dispatch_ready(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    target_ws: &WorkspaceHandle,
    running_ws: Option<&WorkspaceHandle>,
    app_config: &ApplicationConfig,
    application: &Application,
    approvals: &Arc<ApprovalGate>,
    inflight: &mut JoinSet<(u32, ExecutionOutcome, u32)>,
    stage_cancels: &mut HashMap<u32, CancelHandle>,
    poisoned: &HashSet<u32>,
) {
    let ready: Vec<u32> = deployment
        .stages
        .iter()
        .filter(|stage| stage.status == StageStatus::NotStarted)
        .filter(|stage| {
            stage.requires.iter().all(|required| {
                deployment
                    .stages
                    .iter()
                    .find(|s| s.index == *required)
                    .map(|s| {
                        s.status == StageStatus::Success
                            || (s.status == StageStatus::Skipped && !poisoned.contains(&s.index))
                    })
                    .unwrap_or(false)
            })
        })
        .map(|stage| stage.index)
        .collect();

    for index in ready {
        set_stage_status(ctx, deployment, index, StageStatus::Running, "", None).await;

        let Some(stage) = deployment.stage(index).cloned() else {
            continue;
        };
        let (handle, token) = CancelHandle::new();
        stage_cancels.insert(index, handle);

        let input = Input {
            deployment: deployment.clone(),
            stage,
            application: application.clone(),
            app_config: app_config.clone(),
            running_workspace: running_ws.map(|ws| ws.path.clone()),
            target_workspace: target_ws.path.clone(),
            cancel: token,
            logs: ctx.reporter.stage_log_sink(&deployment.id, index),
            approvals: approvals.clone(),
            tools: ctx.tools.clone(),
            provider: ctx.providers.get(&app_config.cloud_provider),
        };

        let ctx = ctx.clone();
        inflight.spawn(async move { execute_stage(ctx, input).await });
    }
}

/// Execute one stage under the global concurrency cap, handling timeout,
/// the cancellation window, and the retry budget.
async fn execute_stage(ctx: DriverContext, input: Input) -> (u32, ExecutionOutcome, u32) {
    let index = input.stage.index;
    let timeout = Duration::from_secs(input.stage.timeout_secs);
    let retry_limit = input.stage.retry_limit;
    let mut retried = input.stage.retried_count;

    let _permit = match ctx.slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return (
                index,
                ExecutionOutcome::failure("stage slots are closed"),
                retried,
            )
        }
    };

    loop {
        let executor = match ctx.registry.executor_for(input.stage.kind) {
            Ok(executor) => executor,
            Err(e) => return (index, ExecutionOutcome::failure(e.to_string()), retried),
        };

        let mut attempt_input = input.clone();
        attempt_input.stage.retried_count = retried;
        let mut window_cancel = input.cancel.clone();

        let outcome = tokio::select! {
            finished = tokio::time::timeout(timeout, executor.execute(attempt_input)) => {
                match finished {
                    Ok(outcome) => outcome,
                    Err(_) => ExecutionOutcome::failure(format!(
                        "stage timed out after {}s",
                        input.stage.timeout_secs
                    )),
                }
            }
            // The executor gets a bounded window to surface cancellation;
            // past it the stage is reported CANCELLED regardless.
            _ = async {
                window_cancel.cancelled().await;
                tokio::time::sleep(ctx.options.executor_cancel_window).await;
            } => ExecutionOutcome::Cancelled,
        };

        match outcome {
            ExecutionOutcome::Failure {
                ref reason,
                retryable: true,
            } if retried < retry_limit => {
                retried += 1;
                ctx.reporter
                    .publish(
                        &input.deployment.id,
                        ProgressEvent::StageStatus {
                            index,
                            status: StageStatus::Running,
                            reason: format!("retrying after failure: {}", reason),
                            retried_count: retried,
                        },
                    )
                    .await;

                let mut cancel = input.cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(ctx.options.retry_delay) => {}
                    _ = cancel.cancelled() => return (index, ExecutionOutcome::Cancelled, retried),
                }
            }
            outcome => return (index, outcome, retried),
        }
    }
}

/// Apply one stage outcome, aborting siblings on failure or cancellation.
#[allow(clippy::too_many_arguments)]
async fn react(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    index: u32,
    outcome: ExecutionOutcome,
    retried: u32,
    aborting: &mut bool,
    stage_cancels: &HashMap<u32, CancelHandle>,
    poisoned: &mut HashSet<u32>,
) {
    match outcome {
        ExecutionOutcome::Success => {
            set_stage_status(ctx, deployment, index, StageStatus::Success, "", Some(retried)).await;
        }
        ExecutionOutcome::Skipped => {
            set_stage_status(ctx, deployment, index, StageStatus::Skipped, "stage chose to skip", Some(retried)).await;
        }
        ExecutionOutcome::Failure { reason, .. } => {
            set_stage_status(ctx, deployment, index, StageStatus::Failure, &reason, Some(retried)).await;
            *aborting = true;
            for handle in stage_cancels.values() {
                handle.cancel();
            }
            skip_unstarted(ctx, deployment, poisoned).await;
        }
        ExecutionOutcome::Cancelled => {
            set_stage_status(ctx, deployment, index, StageStatus::Cancelled, "stage was cancelled", Some(retried)).await;
            *aborting = true;
            for handle in stage_cancels.values() {
                handle.cancel();
            }
            skip_unstarted(ctx, deployment, poisoned).await;
        }
    }
}

/// A CHAIN_UPDATE command arrived: re-plan against the repository head and
/// append newly declared trailing stages. Stages already planned are never
/// rewritten.
async fn apply_chain_update(
    ctx: &DriverContext,
    deployment: &mut Deployment,
) -> Result<(), PipedError> {
    let head = ctx.workspaces.clone_or_fetch(&deployment.repo_id).await?;
    let ws = ctx.workspaces.checkout(&deployment.repo_id, &head).await?;
    let config_path = ws
        .path
        .join(&deployment.app_path)
        .join(APPLICATION_CONFIG_FILENAME);
    let contents = tokio::fs::read_to_string(&config_path).await;
    ctx.workspaces.release(ws).await;

    let app_config = ApplicationConfig::parse(&contents?)?;
    let plan = planner::build_plan(&app_config)?;

    if plan.stages.len() <= deployment.stages.len() {
        info!(
            "chain update for {}: no additional stages declared at {}",
            deployment.id, head
        );
        return Ok(());
    }

    let appended: Vec<_> = plan
        .stages
        .into_iter()
        .skip(deployment.stages.len())
        .collect();
    info!(
        "chain update for {}: appending {} stages",
        deployment.id,
        appended.len()
    );
    deployment.stages.extend(appended);

    let summary = format!("plan extended to {} stages by chain update", deployment.stages.len());
    persist_plan(ctx, deployment, &summary).await
}

/// Compute the deployment's terminal status from its stages.
fn terminal_status(deployment: &Deployment, cancel_observed: bool) -> (DeploymentStatus, String) {
    if cancel_observed {
        return (
            DeploymentStatus::Cancelled,
            "deployment was cancelled".to_string(),
        );
    }

    if let Some(failed) = deployment
        .stages
        .iter()
        .find(|s| s.status == StageStatus::Failure)
    {
        return (
            DeploymentStatus::Failure,
            format!("stage {} failed: {}", failed.index, failed.status_reason),
        );
    }

    if deployment
        .stages
        .iter()
        .any(|s| s.status == StageStatus::Cancelled)
    {
        return (
            DeploymentStatus::Cancelled,
            "deployment was cancelled".to_string(),
        );
    }

    (
        DeploymentStatus::Success,
        "all stages completed successfully".to_string(),
    )
}

/// Transition one stage, keeping transitions forward-only, and report it.
async fn set_stage_status(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    index: u32,
    status: StageStatus,
    reason: &str,
    retried: Option<u32>,
) {
    let Some(stage) = deployment.stages.iter_mut().find(|s| s.index == index) else {
        return;
    };
    if !stage.status.can_transition_to(status) {
        warn!(
            "refusing illegal stage transition {:?} -> {:?} on {}:{}",
            stage.status, status, deployment.id, index
        );
        return;
    }

    stage.status = status;
    stage.status_reason = reason.to_string();
    if let Some(retried) = retried {
        stage.retried_count = retried;
    }
    match status {
        StageStatus::Running => stage.started_at = Some(Utc::now()),
        _ => stage.completed_at = Some(Utc::now()),
    }

    let event = ProgressEvent::StageStatus {
        index,
        status,
        reason: reason.to_string(),
        retried_count: stage.retried_count,
    };
    ctx.reporter.publish(&deployment.id, event).await;
}

/// Transition the deployment, keeping transitions forward-only, and report.
async fn set_deployment_status(
    ctx: &DriverContext,
    deployment: &mut Deployment,
    status: DeploymentStatus,
    reason: &str,
) {
    if deployment.status == status {
        return;
    }
    if !deployment.status.can_transition_to(status) {
        warn!(
            "refusing illegal deployment transition {:?} -> {:?} on {}",
            deployment.status, status, deployment.id
        );
        return;
    }

    deployment.status = status;
    deployment.status_reason = reason.to_string();
    deployment.updated_at = Utc::now();

    ctx.reporter
        .publish(
            &deployment.id,
            ProgressEvent::DeploymentStatus {
                status,
                reason: reason.to_string(),
            },
        )
        .await;
}
