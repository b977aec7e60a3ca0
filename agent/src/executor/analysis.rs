//! ANALYSIS stage: observe the release for a configured window.
//!
//! The metric queries themselves live behind [`AnalysisEvaluator`]; the
//! executor owns the observation window, cadence and verdict handling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::executor::{ExecutionOutcome, Input, StageExecutor};

const DEFAULT_ANALYSIS_SECS: u64 = 300;
const DEFAULT_QUERY_INTERVAL_SECS: u64 = 30;

/// Verdict of one evaluation round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisVerdict {
    Pass,
    Fail(String),
}

/// Queries an analysis provider for one round of metric checks
#[async_trait]
pub trait AnalysisEvaluator: Send + Sync {
    async fn evaluate(&self, input: &Input) -> AnalysisVerdict;
}

/// Evaluator used when no analysis provider is configured: every round
/// passes, so the stage degrades to a watched wait window.
pub struct NoopEvaluator;

#[async_trait]
impl AnalysisEvaluator for NoopEvaluator {
    async fn evaluate(&self, _input: &Input) -> AnalysisVerdict {
        AnalysisVerdict::Pass
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AnalysisStageConfig {
    duration_secs: u64,
    query_interval_secs: u64,
}

impl Default for AnalysisStageConfig {
    fn default() -> Self {
        Self {
            duration_secs: DEFAULT_ANALYSIS_SECS,
            query_interval_secs: DEFAULT_QUERY_INTERVAL_SECS,
        }
    }
}

pub struct AnalysisExecutor {
    evaluator: Arc<dyn AnalysisEvaluator>,
}

impl std::fmt::Debug for AnalysisExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisExecutor").finish()
    }
}

impl AnalysisExecutor {
    pub fn new(evaluator: Arc<dyn AnalysisEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl StageExecutor for AnalysisExecutor {
    async fn execute(&self, input: Input) -> ExecutionOutcome {
        let config: AnalysisStageConfig = match serde_json::from_value(input.stage.config.clone())
        {
            Ok(config) => config,
            Err(_) if input.stage.config.is_null() => AnalysisStageConfig::default(),
            Err(e) => return ExecutionOutcome::failure(format!("invalid analysis config: {}", e)),
        };

        input
            .logs
            .info(format!(
                "analysing release for {}s (query every {}s)...",
                config.duration_secs, config.query_interval_secs
            ))
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(config.duration_secs);
        let interval = Duration::from_secs(config.query_interval_secs.max(1));
        let mut cancel = input.cancel.clone();

        loop {
            match self.evaluator.evaluate(&input).await {
                AnalysisVerdict::Pass => {}
                AnalysisVerdict::Fail(reason) => {
                    input.logs.error(format!("analysis failed: {}", reason)).await;
                    return ExecutionOutcome::failure(reason);
                }
            }

            if tokio::time::Instant::now() + interval >= deadline {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return ExecutionOutcome::Cancelled,
            }
        }

        input.logs.success("analysis passed").await;
        ExecutionOutcome::Success
    }
}
