//! TERRAFORM_PLAN and TERRAFORM_APPLY stages.
//!
//! Both shell out to a registry-resolved terraform binary inside the
//! application directory of the target checkout.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::executor::{ExecutionOutcome, Input, StageExecutor};
use crate::reporter::StageLogSink;

const TERRAFORM_VERSION: &str = "0.13.5";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TerraformStageConfig {
    /// Variables passed with -var, formatted as key=value
    vars: Vec<String>,
}

#[derive(Debug)]
enum Mode {
    Plan,
    Apply,
}

#[derive(Debug)]
pub struct TerraformExecutor {
    mode: Mode,
}

impl TerraformExecutor {
    pub fn plan() -> Self {
        Self { mode: Mode::Plan }
    }

    pub fn apply() -> Self {
        Self { mode: Mode::Apply }
    }
}

/// Run one terraform subcommand, streaming stdout lines into the sink.
async fn run_terraform(
    binary: &Path,
    app_dir: &Path,
    args: &[&str],
    logs: &StageLogSink,
) -> Result<(), String> {
    let mut child = Command::new(binary)
        .args(args)
        .current_dir(app_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to run terraform: {}", e))?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.info(line).await;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(stderr.trim().to_string());
    }
    Ok(())
}

#[async_trait]
impl StageExecutor for TerraformExecutor {
    async fn execute(&self, input: Input) -> ExecutionOutcome {
        let config: TerraformStageConfig = match serde_json::from_value(input.stage.config.clone())
        {
            Ok(config) => config,
            Err(_) if input.stage.config.is_null() => TerraformStageConfig::default(),
            Err(e) => {
                return ExecutionOutcome::failure(format!("invalid terraform config: {}", e))
            }
        };

        let terraform = match input.tools.resolve("terraform", TERRAFORM_VERSION).await {
            Ok(path) => path,
            Err(e) => return ExecutionOutcome::retryable_failure(e.to_string()),
        };

        let app_dir = input.target_app_dir();
        if let Err(e) = run_terraform(&terraform, &app_dir, &["init", "-no-color"], &input.logs)
            .await
        {
            return ExecutionOutcome::retryable_failure(format!("terraform init failed: {}", e));
        }

        let mut args: Vec<String> = match self.mode {
            Mode::Plan => vec!["plan".to_string(), "-no-color".to_string()],
            Mode::Apply => vec![
                "apply".to_string(),
                "-no-color".to_string(),
                "-auto-approve".to_string(),
            ],
        };
        for var in &config.vars {
            args.push("-var".to_string());
            args.push(var.clone());
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

        let mut cancel = input.cancel.clone();
        let run = run_terraform(&terraform, &app_dir, &arg_refs, &input.logs);
        tokio::select! {
            result = run => match result {
                Ok(()) => {
                    input.logs.success("terraform finished").await;
                    ExecutionOutcome::Success
                }
                Err(e) => {
                    input.logs.error(e.clone()).await;
                    ExecutionOutcome::failure(e)
                }
            },
            // kill_on_drop tears the child down when the select abandons it.
            _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
        }
    }
}
