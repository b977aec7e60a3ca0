//! HTTP binding of the control-plane API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error};

use crate::api::client::{
    ApiClient, CreateDeploymentRequest, LogBlock, PipedStat,
};
use crate::errors::PipedError;
use crate::model::application::{Application, ApplicationSyncState};
use crate::model::command::{Command, CommandResult};
use crate::model::deployment::{
    Deployment, DeploymentStatus, Stage, StageStatus,
};
use crate::model::livestate::ApplicationLiveState;

const PROJECT_ID_HEADER: &str = "X-Piped-Project-Id";
const PIPED_ID_HEADER: &str = "X-Piped-Id";

/// Authenticated HTTP client for the control-plane API
pub struct HttpApiClient {
    client: Client,
    base_url: String,
    project_id: String,
    piped_id: String,
    piped_key: String,
}

impl HttpApiClient {
    pub fn new(
        base_url: &str,
        project_id: &str,
        piped_id: &str,
        piped_key: &str,
    ) -> Result<Self, PipedError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            piped_id: piped_id.to_string(),
            piped_key: piped_key.trim().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PipedError> {
        let url = self.url(path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.piped_key))
            .header(PROJECT_ID_HEADER, &self.project_id)
            .header(PIPED_ID_HEADER, &self.piped_id)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("GET {} failed: {} - {}", url, status, body);
            return Err(PipedError::Api(format!("{}: {}", status, body)));
        }

        Ok(response.json().await?)
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PipedError> {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.piped_key))
            .header(PROJECT_ID_HEADER, &self.project_id)
            .header(PIPED_ID_HEADER, &self.piped_id)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("POST {} failed: {} - {}", url, status, body);
            return Err(PipedError::Api(format!("{}: {}", status, body)));
        }

        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct ApplicationList {
    applications: Vec<Application>,
}

#[derive(Debug, Deserialize)]
struct DeploymentList {
    deployments: Vec<Deployment>,
}

#[derive(Debug, Deserialize)]
struct CommandList {
    commands: Vec<Command>,
}

#[derive(Debug, Deserialize)]
struct CreatedDeployment {
    deployment_id: String,
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn ping(&self, stat: PipedStat) -> Result<(), PipedError> {
        let _: Empty = self.post("/piped/ping", &stat).await?;
        Ok(())
    }

    async fn list_applications(&self) -> Result<Vec<Application>, PipedError> {
        let list: ApplicationList = self.get("/piped/applications").await?;
        Ok(list.applications)
    }

    async fn report_application_sync_state(
        &self,
        application_id: &str,
        state: ApplicationSyncState,
    ) -> Result<(), PipedError> {
        let path = format!("/piped/applications/{}/sync-state", application_id);
        let _: Empty = self.post(&path, &state).await?;
        Ok(())
    }

    async fn report_application_live_state(
        &self,
        state: ApplicationLiveState,
    ) -> Result<(), PipedError> {
        let path = format!("/piped/applications/{}/live-state", state.application_id);
        let _: Empty = self.post(&path, &state).await?;
        Ok(())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>, PipedError> {
        let list: DeploymentList = self.get("/piped/deployments?completed=false").await?;
        Ok(list.deployments)
    }

    async fn report_deployment_planned(
        &self,
        deployment_id: &str,
        stages: Vec<Stage>,
        status_reason: &str,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Body<'a> {
            stages: Vec<Stage>,
            status_reason: &'a str,
        }

        let path = format!("/piped/deployments/{}/planned", deployment_id);
        let _: Empty = self
            .post(
                &path,
                &Body {
                    stages,
                    status_reason,
                },
            )
            .await?;
        Ok(())
    }

    async fn report_deployment_status_changed(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        status_reason: &str,
        seq: u64,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Body<'a> {
            status: DeploymentStatus,
            status_reason: &'a str,
            seq: u64,
        }

        let path = format!("/piped/deployments/{}/status", deployment_id);
        let _: Empty = self
            .post(
                &path,
                &Body {
                    status,
                    status_reason,
                    seq,
                },
            )
            .await?;
        Ok(())
    }

    async fn report_stage_status_changed(
        &self,
        deployment_id: &str,
        stage_index: u32,
        status: StageStatus,
        status_reason: &str,
        retried_count: u32,
        seq: u64,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Body<'a> {
            stage_index: u32,
            status: StageStatus,
            status_reason: &'a str,
            retried_count: u32,
            seq: u64,
        }

        let path = format!("/piped/deployments/{}/stage-status", deployment_id);
        let _: Empty = self
            .post(
                &path,
                &Body {
                    stage_index,
                    status,
                    status_reason,
                    retried_count,
                    seq,
                },
            )
            .await?;
        Ok(())
    }

    async fn report_stage_logs(
        &self,
        deployment_id: &str,
        stage_index: u32,
        blocks: Vec<LogBlock>,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Body {
            stage_index: u32,
            blocks: Vec<LogBlock>,
        }

        let path = format!("/piped/deployments/{}/stage-logs", deployment_id);
        let _: Empty = self
            .post(
                &path,
                &Body {
                    stage_index,
                    blocks,
                },
            )
            .await?;
        Ok(())
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>, PipedError> {
        let list: CommandList = self.get("/piped/commands?handled=false").await?;
        Ok(list.commands)
    }

    async fn report_command_handled(
        &self,
        command_id: &str,
        result: CommandResult,
        output: Vec<u8>,
    ) -> Result<(), PipedError> {
        #[derive(Serialize)]
        struct Body {
            result: CommandResult,
            output: Vec<u8>,
        }

        let path = format!("/piped/commands/{}/handled", command_id);
        let _: Empty = self.post(&path, &Body { result, output }).await?;
        Ok(())
    }

    async fn create_deployment(
        &self,
        request: CreateDeploymentRequest,
    ) -> Result<String, PipedError> {
        let created: CreatedDeployment = self.post("/piped/deployments", &request).await?;
        Ok(created.deployment_id)
    }
}
