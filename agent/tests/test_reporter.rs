//! Progress reporter delivery guarantees.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeApiClient, TestEnv};
use piped::api::client::LogSeverity;
use piped::model::deployment::{DeploymentStatus, StageStatus};
use piped::reporter::{ProgressEvent, ProgressReporter};

fn reporter(api: Arc<FakeApiClient>) -> Arc<ProgressReporter> {
    Arc::new(ProgressReporter::new(api, TestEnv::reporter_options()))
}

#[tokio::test]
async fn test_events_delivered_in_seq_order() {
    let api = FakeApiClient::new();
    let reporter = reporter(api.clone());

    for i in 0..10u32 {
        reporter
            .publish(
                "dep-1",
                ProgressEvent::StageStatus {
                    index: i,
                    status: StageStatus::Running,
                    reason: String::new(),
                    retried_count: 0,
                },
            )
            .await;
    }
    reporter
        .publish(
            "dep-1",
            ProgressEvent::DeploymentStatus {
                status: DeploymentStatus::Success,
                reason: "done".to_string(),
            },
        )
        .await;
    reporter.finish("dep-1").await;

    let seqs = api.seqs.lock().unwrap();
    let observed = seqs.get("dep-1").unwrap();
    let expected: Vec<u64> = (0..11).collect();
    assert_eq!(*observed, expected);
}

#[tokio::test]
async fn test_api_failures_are_retried_not_dropped() {
    let api = FakeApiClient::new();
    // The first three report calls fail; delivery must retry through them.
    api.failing_reports.store(3, Ordering::SeqCst);
    let reporter = reporter(api.clone());

    for i in 0..5u32 {
        reporter
            .publish(
                "dep-retry",
                ProgressEvent::StageStatus {
                    index: i,
                    status: StageStatus::Success,
                    reason: String::new(),
                    retried_count: 0,
                },
            )
            .await;
    }
    reporter.finish("dep-retry").await;

    let events = api.stage_events.lock().unwrap();
    let delivered: Vec<u32> = events
        .iter()
        .filter(|(id, ..)| id == "dep-retry")
        .map(|(_, index, ..)| *index)
        .collect();
    assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_consecutive_stage_logs_batch_into_blocks() {
    let api = FakeApiClient::new();
    let reporter = reporter(api.clone());

    let sink = reporter.stage_log_sink("dep-logs", 0);
    sink.info("step one").await;
    sink.info("step two").await;
    sink.error("step three failed").await;
    reporter.finish("dep-logs").await;

    let logs = api.logs.lock().unwrap();
    let lines: Vec<&str> = logs
        .iter()
        .filter(|(id, index, _)| id == "dep-logs" && *index == 0)
        .map(|(_, _, block)| block.log.as_str())
        .collect();
    assert_eq!(lines, vec!["step one", "step two", "step three failed"]);

    let severities: Vec<LogSeverity> = logs.iter().map(|(_, _, b)| b.severity).collect();
    assert_eq!(severities[2], LogSeverity::Error);
}

#[tokio::test]
async fn test_deployments_do_not_share_sequences() {
    let api = FakeApiClient::new();
    let reporter = reporter(api.clone());

    for dep in ["dep-a", "dep-b"] {
        for _ in 0..3 {
            reporter
                .publish(
                    dep,
                    ProgressEvent::StageStatus {
                        index: 0,
                        status: StageStatus::Running,
                        reason: String::new(),
                        retried_count: 0,
                    },
                )
                .await;
        }
    }
    reporter.finish("dep-a").await;
    reporter.finish("dep-b").await;

    let seqs = api.seqs.lock().unwrap();
    // Each deployment's stream starts at zero and is gapless.
    assert_eq!(seqs.get("dep-a").unwrap(), &vec![0, 1, 2]);
    assert_eq!(seqs.get("dep-b").unwrap(), &vec![0, 1, 2]);
}

#[tokio::test]
async fn test_shutdown_aborts_without_hanging() {
    let api = FakeApiClient::new();
    // Reports fail forever; shutdown must still return promptly.
    api.failing_reports.store(u32::MAX, Ordering::SeqCst);
    let reporter = reporter(api.clone());

    reporter
        .publish(
            "dep-stuck",
            ProgressEvent::DeploymentStatus {
                status: DeploymentStatus::Running,
                reason: String::new(),
            },
        )
        .await;

    tokio::time::timeout(Duration::from_secs(2), reporter.shutdown())
        .await
        .expect("shutdown must not block on a failing API");
}
