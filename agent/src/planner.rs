//! Pipeline planning.
//!
//! Derives the ordered list of stages for a deployment from the declared
//! pipeline in the application config. An empty pipeline becomes a single
//! SYNC stage. Stage dependencies default to a linear chain; explicit
//! `requires` lists may fan out but only ever point backwards, so the plan
//! is a DAG by construction.

use crate::config::app::ApplicationConfig;
use crate::errors::PipedError;
use crate::model::deployment::{Stage, StageKind, StageStatus};

const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// A freshly planned pipeline plus its summary reason text
#[derive(Debug, Clone)]
pub struct Plan {
    pub stages: Vec<Stage>,
    pub summary: String,
}

/// Build the stage plan for one deployment
pub fn build_plan(app_config: &ApplicationConfig) -> Result<Plan, PipedError> {
    if app_config.pipeline.is_empty() {
        return Ok(Plan {
            stages: vec![new_stage(0, StageKind::Sync, Vec::new(), serde_json::Value::Null, 0, None)],
            summary: "no pipeline configured; planned a single sync stage".to_string(),
        });
    }

    let mut stages = Vec::with_capacity(app_config.pipeline.len());
    for (i, spec) in app_config.pipeline.iter().enumerate() {
        let index = i as u32;
        let requires = match &spec.requires {
            Some(requires) => {
                for &required in requires {
                    if required >= index {
                        return Err(PipedError::Config(format!(
                            "stage {} requires {} which is not an earlier stage",
                            index, required
                        )));
                    }
                }
                requires.clone()
            }
            None if index == 0 => Vec::new(),
            None => vec![index - 1],
        };

        stages.push(new_stage(
            index,
            spec.name,
            requires,
            spec.config.clone(),
            spec.retries,
            spec.timeout_secs,
        ));
    }

    let names: Vec<&str> = stages.iter().map(|s| s.kind.as_str()).collect();
    Ok(Plan {
        summary: format!("planned {} stages: {}", stages.len(), names.join(", ")),
        stages,
    })
}

fn new_stage(
    index: u32,
    kind: StageKind,
    requires: Vec<u32>,
    config: serde_json::Value,
    retry_limit: u32,
    timeout_secs: Option<u64>,
) -> Stage {
    Stage {
        index,
        kind,
        requires,
        config,
        retry_limit,
        timeout_secs: timeout_secs.unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS),
        status: StageStatus::NotStarted,
        retried_count: 0,
        status_reason: String::new(),
        started_at: None,
        completed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::app::ApplicationConfig;

    #[test]
    fn test_empty_pipeline_plans_single_sync() {
        let config = ApplicationConfig::parse("kind: KUBERNETES").unwrap();
        let plan = build_plan(&config).unwrap();

        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].kind, StageKind::Sync);
        assert!(plan.stages[0].requires.is_empty());
        assert_eq!(plan.stages[0].status, StageStatus::NotStarted);
    }

    #[test]
    fn test_linear_chain_by_default() {
        let doc = r#"
kind: KUBERNETES
pipeline:
  - name: ANALYSIS
  - name: WAIT_APPROVAL
  - name: SYNC
"#;
        let config = ApplicationConfig::parse(doc).unwrap();
        let plan = build_plan(&config).unwrap();

        assert_eq!(plan.stages.len(), 3);
        assert!(plan.stages[0].requires.is_empty());
        assert_eq!(plan.stages[1].requires, vec![0]);
        assert_eq!(plan.stages[2].requires, vec![1]);
    }

    #[test]
    fn test_fan_out_requires() {
        let doc = r#"
kind: KUBERNETES
pipeline:
  - name: SYNC
  - name: ANALYSIS
    requires: [0]
  - name: WAIT
    requires: [0]
  - name: SYNC
    requires: [1, 2]
"#;
        let config = ApplicationConfig::parse(doc).unwrap();
        let plan = build_plan(&config).unwrap();

        assert_eq!(plan.stages[1].requires, vec![0]);
        assert_eq!(plan.stages[2].requires, vec![0]);
        assert_eq!(plan.stages[3].requires, vec![1, 2]);
    }

    #[test]
    fn test_forward_requires_rejected() {
        let doc = r#"
kind: KUBERNETES
pipeline:
  - name: SYNC
    requires: [1]
  - name: WAIT
"#;
        let config = ApplicationConfig::parse(doc).unwrap();
        assert!(build_plan(&config).is_err());
    }

    #[test]
    fn test_stage_defaults() {
        let doc = r#"
kind: KUBERNETES
pipeline:
  - name: SYNC
    retries: 2
    timeoutSecs: 900
"#;
        let config = ApplicationConfig::parse(doc).unwrap();
        let plan = build_plan(&config).unwrap();

        assert_eq!(plan.stages[0].retry_limit, 2);
        assert_eq!(plan.stages[0].timeout_secs, 900);
    }
}
