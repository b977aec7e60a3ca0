//! End-to-end deployment controller scenarios against an in-memory control
//! plane and a real git origin.

mod common;

use std::time::Duration;

use common::{wait_stage, wait_terminal, Behavior, FakeExecutor, TestEnv};
use piped::model::deployment::{DeploymentStatus, StageKind, StageStatus};

const PLAN_APPLY_PIPELINE: &str = r#"
kind: KUBERNETES
pipeline:
  - name: TERRAFORM_PLAN
  - name: TERRAFORM_APPLY
"#;

#[tokio::test]
async fn test_linear_pipeline_happy_path() {
    let env = TestEnv::new(PLAN_APPLY_PIPELINE);
    let plan = FakeExecutor::new(Behavior::Succeed);
    let apply = FakeExecutor::new(Behavior::Succeed);
    env.registry
        .register(StageKind::TerraformPlan, plan.factory())
        .unwrap();
    env.registry
        .register(StageKind::TerraformApply, apply.factory())
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-linear"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-linear").await;
    assert_eq!(status, DeploymentStatus::Success);

    // The plan was persisted before any stage ran, in declared order.
    let planned = env.api.planned.lock().unwrap();
    assert_eq!(planned.len(), 1);
    let stages = &planned[0].1;
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0].kind, StageKind::TerraformPlan);
    assert_eq!(stages[1].kind, StageKind::TerraformApply);
    drop(planned);

    assert_eq!(
        env.api.stage_status("dep-linear", 0),
        Some(StageStatus::Success)
    );
    assert_eq!(
        env.api.stage_status("dep-linear", 1),
        Some(StageStatus::Success)
    );

    // Both executors ran exactly once.
    assert_eq!(plan.executions.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(apply.executions.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_skips_subsequent_stages() {
    let pipeline = r#"
kind: KUBERNETES
pipeline:
  - name: TERRAFORM_PLAN
  - name: ANALYSIS
  - name: TERRAFORM_APPLY
"#;
    let env = TestEnv::new(pipeline);
    env.registry
        .register(
            StageKind::TerraformPlan,
            FakeExecutor::new(Behavior::Succeed).factory(),
        )
        .unwrap();
    env.registry
        .register(
            StageKind::Analysis,
            FakeExecutor::new(Behavior::Fail("error rate too high")).factory(),
        )
        .unwrap();
    let apply = FakeExecutor::new(Behavior::Succeed);
    env.registry
        .register(StageKind::TerraformApply, apply.factory())
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-failure"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-failure").await;
    assert_eq!(status, DeploymentStatus::Failure);

    assert_eq!(
        env.api.stage_status("dep-failure", 1),
        Some(StageStatus::Failure)
    );
    assert_eq!(
        env.api.stage_status("dep-failure", 2),
        Some(StageStatus::Skipped)
    );
    // The skipped stage's executor never ran.
    assert_eq!(apply.executions.load(std::sync::atomic::Ordering::SeqCst), 0);

    // The deployment reason carries the stage's reason.
    let deployments = env.api.deployments.lock().unwrap();
    let deployment = deployments.iter().find(|d| d.id == "dep-failure").unwrap();
    assert!(deployment.status_reason.contains("error rate too high"));
}

#[tokio::test]
async fn test_cancellation_mid_stage() {
    let env = TestEnv::new(PLAN_APPLY_PIPELINE);
    env.registry
        .register(
            StageKind::TerraformPlan,
            FakeExecutor::new(Behavior::Block).factory(),
        )
        .unwrap();
    env.registry
        .register(
            StageKind::TerraformApply,
            FakeExecutor::new(Behavior::Succeed).factory(),
        )
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-cancel"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    wait_stage(&env.api, "dep-cancel", 0, StageStatus::Running).await;
    assert!(scheduler.cancel("dep-cancel").await);

    let status = wait_terminal(&env.api, "dep-cancel").await;
    assert_eq!(status, DeploymentStatus::Cancelled);
    assert_eq!(
        env.api.stage_status("dep-cancel", 0),
        Some(StageStatus::Cancelled)
    );
    assert_eq!(
        env.api.stage_status("dep-cancel", 1),
        Some(StageStatus::Skipped)
    );
}

#[tokio::test]
async fn test_cancel_unknown_deployment_is_refused() {
    let env = TestEnv::new(PLAN_APPLY_PIPELINE);
    let scheduler = env.scheduler();
    assert!(!scheduler.cancel("nope").await);
}

#[tokio::test]
async fn test_approval_timeout_fails_deployment() {
    let pipeline = r#"
kind: KUBERNETES
pipeline:
  - name: WAIT_APPROVAL
    with:
      timeoutSecs: 1
  - name: TERRAFORM_APPLY
"#;
    let env = TestEnv::new(pipeline);
    env.registry
        .register(
            StageKind::WaitApproval,
            std::sync::Arc::new(|| {
                std::sync::Arc::new(piped::executor::approval::WaitApprovalExecutor)
                    as std::sync::Arc<dyn piped::executor::StageExecutor>
            }),
        )
        .unwrap();
    let apply = FakeExecutor::new(Behavior::Succeed);
    env.registry
        .register(StageKind::TerraformApply, apply.factory())
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-approval"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-approval").await;
    assert_eq!(status, DeploymentStatus::Failure);
    assert_eq!(
        env.api.stage_status("dep-approval", 0),
        Some(StageStatus::Failure)
    );
    assert_eq!(
        env.api.stage_status("dep-approval", 1),
        Some(StageStatus::Skipped)
    );
    assert_eq!(apply.executions.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_approval_command_unblocks_stage() {
    let pipeline = r#"
kind: KUBERNETES
pipeline:
  - name: WAIT_APPROVAL
    with:
      timeoutSecs: 30
  - name: TERRAFORM_APPLY
"#;
    let env = TestEnv::new(pipeline);
    env.registry
        .register(
            StageKind::WaitApproval,
            std::sync::Arc::new(|| {
                std::sync::Arc::new(piped::executor::approval::WaitApprovalExecutor)
                    as std::sync::Arc<dyn piped::executor::StageExecutor>
            }),
        )
        .unwrap();
    env.registry
        .register(
            StageKind::TerraformApply,
            FakeExecutor::new(Behavior::Succeed).factory(),
        )
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-approved"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    wait_stage(&env.api, "dep-approved", 0, StageStatus::Running).await;
    assert!(scheduler.approve("dep-approved", 0).await);

    let status = wait_terminal(&env.api, "dep-approved").await;
    assert_eq!(status, DeploymentStatus::Success);
    assert_eq!(
        env.api.stage_status("dep-approved", 0),
        Some(StageStatus::Success)
    );
}

#[tokio::test]
async fn test_retryable_failure_retries_then_succeeds() {
    let pipeline = r#"
kind: KUBERNETES
pipeline:
  - name: TERRAFORM_APPLY
    retries: 2
"#;
    let env = TestEnv::new(pipeline);
    let apply = FakeExecutor::new(Behavior::FlakyThenSucceed(1));
    env.registry
        .register(StageKind::TerraformApply, apply.factory())
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-retry"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-retry").await;
    assert_eq!(status, DeploymentStatus::Success);
    assert_eq!(apply.executions.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(env.api.stage_retried_count("dep-retry", 0), Some(1));
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails() {
    let pipeline = r#"
kind: KUBERNETES
pipeline:
  - name: TERRAFORM_APPLY
    retries: 1
"#;
    let env = TestEnv::new(pipeline);
    let apply = FakeExecutor::new(Behavior::FlakyThenSucceed(10));
    env.registry
        .register(StageKind::TerraformApply, apply.factory())
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-exhausted"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-exhausted").await;
    assert_eq!(status, DeploymentStatus::Failure);
    // Initial attempt plus one retry.
    assert_eq!(apply.executions.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_pipeline_plans_single_sync() {
    let env = TestEnv::new("kind: KUBERNETES\n");
    let sync = FakeExecutor::new(Behavior::Succeed);
    env.registry.register(StageKind::Sync, sync.factory()).unwrap();

    env.api.seed_deployment(env.deployment("dep-sync"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-sync").await;
    assert_eq!(status, DeploymentStatus::Success);

    let planned = env.api.planned.lock().unwrap();
    assert_eq!(planned[0].1.len(), 1);
    assert_eq!(planned[0].1[0].kind, StageKind::Sync);
}

#[tokio::test]
async fn test_second_tick_does_not_duplicate_driver() {
    let env = TestEnv::new(PLAN_APPLY_PIPELINE);
    let plan = FakeExecutor::new(Behavior::SleepThenSucceed(Duration::from_millis(300)));
    env.registry
        .register(StageKind::TerraformPlan, plan.factory())
        .unwrap();
    env.registry
        .register(
            StageKind::TerraformApply,
            FakeExecutor::new(Behavior::Succeed).factory(),
        )
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-once"));
    let scheduler = env.scheduler();
    assert_eq!(scheduler.tick().await.unwrap(), 1);
    // The deployment is still non-terminal; a second tick must not start a
    // second driver for it.
    assert_eq!(scheduler.tick().await.unwrap(), 0);

    let status = wait_terminal(&env.api, "dep-once").await;
    assert_eq!(status, DeploymentStatus::Success);
    assert_eq!(plan.executions.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resume_from_persisted_plan_reruns_interrupted_stage() {
    let env = TestEnv::new(PLAN_APPLY_PIPELINE);
    let plan = FakeExecutor::new(Behavior::Succeed);
    let apply = FakeExecutor::new(Behavior::Succeed);
    env.registry
        .register(StageKind::TerraformPlan, plan.factory())
        .unwrap();
    env.registry
        .register(StageKind::TerraformApply, apply.factory())
        .unwrap();

    // A previous run planned both stages, finished the first, and was killed
    // while the second was RUNNING.
    let mut deployment = env.deployment("dep-reclaim");
    let planned = piped::planner::build_plan(
        &piped::config::app::ApplicationConfig::parse(PLAN_APPLY_PIPELINE).unwrap(),
    )
    .unwrap();
    deployment.stages = planned.stages;
    deployment.stages[0].status = StageStatus::Success;
    deployment.stages[1].status = StageStatus::Running;
    deployment.status = DeploymentStatus::Running;
    env.api.seed_deployment(deployment);

    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-reclaim").await;
    assert_eq!(status, DeploymentStatus::Success);

    // The finished stage was not re-run; the interrupted one was.
    assert_eq!(plan.executions.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(apply.executions.load(std::sync::atomic::Ordering::SeqCst), 1);
    // No re-planning happened on resume.
    assert!(env.api.planned.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_seqs_are_monotone_without_gaps() {
    let env = TestEnv::new(PLAN_APPLY_PIPELINE);
    env.registry
        .register(
            StageKind::TerraformPlan,
            FakeExecutor::new(Behavior::Succeed).factory(),
        )
        .unwrap();
    env.registry
        .register(
            StageKind::TerraformApply,
            FakeExecutor::new(Behavior::Succeed).factory(),
        )
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-seq"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();
    wait_terminal(&env.api, "dep-seq").await;

    let seqs = env.api.seqs.lock().unwrap();
    let observed = seqs.get("dep-seq").expect("events were reported");
    let expected: Vec<u64> = (0..observed.len() as u64).collect();
    assert_eq!(*observed, expected, "delivery must follow seq order with no gaps");
}

#[tokio::test]
async fn test_fan_out_requires_join() {
    let pipeline = r#"
kind: KUBERNETES
pipeline:
  - name: TERRAFORM_PLAN
  - name: ANALYSIS
    requires: [0]
  - name: WAIT
    requires: [0]
  - name: TERRAFORM_APPLY
    requires: [1, 2]
"#;
    let env = TestEnv::new(pipeline);
    env.registry
        .register(
            StageKind::TerraformPlan,
            FakeExecutor::new(Behavior::Succeed).factory(),
        )
        .unwrap();
    env.registry
        .register(
            StageKind::Analysis,
            FakeExecutor::new(Behavior::SleepThenSucceed(Duration::from_millis(100))).factory(),
        )
        .unwrap();
    env.registry
        .register(
            StageKind::Wait,
            FakeExecutor::new(Behavior::SleepThenSucceed(Duration::from_millis(50))).factory(),
        )
        .unwrap();
    let join = FakeExecutor::new(Behavior::Succeed);
    env.registry
        .register(StageKind::TerraformApply, join.factory())
        .unwrap();

    env.api.seed_deployment(env.deployment("dep-dag"));
    let scheduler = env.scheduler();
    scheduler.tick().await.unwrap();

    let status = wait_terminal(&env.api, "dep-dag").await;
    assert_eq!(status, DeploymentStatus::Success);
    for index in 0..4 {
        assert_eq!(
            env.api.stage_status("dep-dag", index),
            Some(StageStatus::Success)
        );
    }
    assert_eq!(join.executions.load(std::sync::atomic::Ordering::SeqCst), 1);
}
