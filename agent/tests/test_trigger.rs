//! Deployment trigger scenarios against a real git origin.

mod common;

use std::sync::Arc;

use common::{commit_change, TestEnv};
use piped::filesys::file::File;
use piped::model::deployment::TriggerSource;
use piped::trigger::DeploymentTrigger;

const APP_CONFIG: &str = r#"
kind: KUBERNETES
trigger:
  paths:
    - shared/config
"#;

async fn build_trigger(env: &TestEnv) -> Arc<DeploymentTrigger> {
    Arc::new(
        DeploymentTrigger::load(
            env.api.clone(),
            env.workspaces.clone(),
            env.appstore.clone(),
            File::new(env.root.path().join("trigger.json")),
        )
        .await,
    )
}

#[tokio::test]
async fn test_first_observation_triggers_once() {
    let env = TestEnv::new(APP_CONFIG);
    let trigger = build_trigger(&env).await;

    // First tick discovers the application and triggers its initial sync.
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 1);
    assert_eq!(env.appstore.list().len(), 1);

    let created = env.api.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].trigger.source, TriggerSource::Scheduled);
    assert_eq!(created[0].trigger.commit_to, env.head);
}

#[tokio::test]
async fn test_duplicate_trigger_suppressed_while_deployment_runs() {
    let env = TestEnv::new(APP_CONFIG);
    let trigger = build_trigger(&env).await;

    assert_eq!(trigger.tick_repo("main").await.unwrap(), 1);

    // The deployment has not terminated; two further ticks must not create
    // another one, even with a new commit.
    commit_change(&env.origin(), "app/manifest.yaml", "kind: ConfigMap\ndata: {}\n");
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 0);
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 0);
    assert_eq!(env.api.created.lock().unwrap().len(), 1);

    // Once it completes, the pending change is picked up.
    env.api.complete_all();
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 1);
    assert_eq!(env.api.created.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unrelated_changes_do_not_trigger() {
    let env = TestEnv::new(APP_CONFIG);
    let trigger = build_trigger(&env).await;

    assert_eq!(trigger.tick_repo("main").await.unwrap(), 1);
    env.api.complete_all();

    // Same head: nothing to do.
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 0);

    // A change outside the app path and watched prefixes is ignored.
    commit_change(&env.origin(), "README.md", "docs only\n");
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 0);

    // A change under a watched prefix triggers.
    std::fs::create_dir_all(env.origin().join("shared/config")).unwrap();
    commit_change(&env.origin(), "shared/config/flags.yaml", "a: 1\n");
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 1);
}

#[tokio::test]
async fn test_last_triggered_commit_survives_restart() {
    let env = TestEnv::new(APP_CONFIG);

    {
        let trigger = build_trigger(&env).await;
        assert_eq!(trigger.tick_repo("main").await.unwrap(), 1);
        env.api.complete_all();
    }

    // A fresh trigger instance restores the persisted state and does not
    // re-trigger an unchanged application.
    let trigger = build_trigger(&env).await;
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 0);
    assert_eq!(env.api.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_sync_command_creates_command_sourced_deployment() {
    let env = TestEnv::new(APP_CONFIG);
    let trigger = build_trigger(&env).await;

    trigger.tick_repo("main").await.unwrap();
    env.api.complete_all();
    let app_id = env.appstore.list()[0].id.clone();

    trigger.trigger_sync(&app_id, "alice").await.unwrap();

    let created = env.api.created.lock().unwrap();
    let latest = created.last().unwrap();
    assert_eq!(latest.trigger.source, TriggerSource::Command);
    assert_eq!(latest.trigger.commander.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_sync_command_refused_while_deployment_runs() {
    let env = TestEnv::new(APP_CONFIG);
    let trigger = build_trigger(&env).await;

    trigger.tick_repo("main").await.unwrap();
    let app_id = env.appstore.list()[0].id.clone();

    // The initial deployment is still in flight.
    let result = trigger.trigger_sync(&app_id, "alice").await;
    assert!(result.is_err());
    assert_eq!(env.api.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_config_app_not_triggered() {
    let env = TestEnv::new(APP_CONFIG);
    let trigger = build_trigger(&env).await;

    trigger.tick_repo("main").await.unwrap();
    env.api.complete_all();

    // Break the application config; the app is marked invalid and skipped.
    commit_change(&env.origin(), "app/.piped.yaml", "kind: [broken");
    assert_eq!(trigger.tick_repo("main").await.unwrap(), 0);

    let app = &env.appstore.list()[0];
    assert!(app.config.is_none());
    assert!(!app.is_deployable());
}
