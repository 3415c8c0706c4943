//! Client for the Builder Service

use crate::models::{DeployRequest, DeployResponse, ScaffoldRequest, ScaffoldResponse};
use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(60);

/// Username that, with no real password, means "use the builder's ambient identity"
pub const AMBIENT_USERNAME: &str = "AWS";
pub const DUMMY_PASSWORD: &str = "dummy-password";

/// Registry credentials as sent to the builder.
///
/// The conventional `AWS` user without a real password becomes empty
/// credentials so the builder falls back to its own identity.
pub fn normalize_credentials(username: &str, password: Option<&str>) -> (String, String) {
    let ambient = username == AMBIENT_USERNAME
        && password.map_or(true, |p| p.is_empty() || p == DUMMY_PASSWORD);
    if ambient {
        (String::new(), String::new())
    } else {
        (username.to_string(), password.unwrap_or_default().to_string())
    }
}

/// An uploaded source file
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Body of a push submission
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub registry_url: String,
    pub username: String,
    pub password: String,
    pub tag: String,
    pub workspace_id: String,
    pub s3_source_path: String,
}

/// Form fields of a build-and-push submission
#[derive(Debug, Clone)]
pub struct BuildAndPushPayload {
    pub registry_url: String,
    pub username: String,
    pub password: String,
    pub tag: String,
    pub workspace_id: String,
    pub app_name: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteTaskResult {
    #[serde(default)]
    pub wasm_path: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_uri: Option<String>,
}

/// Task state as reported by the builder's status endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteTaskStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<RemoteTaskResult>,
    #[serde(default)]
    pub error: Option<String>,
}

/// How a remote status maps onto the local lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Succeeded {
        wasm_path: Option<String>,
        image_ref: Option<String>,
    },
    Failed(Option<String>),
    InProgress(String),
}

impl RemoteTaskStatus {
    pub fn outcome(&self) -> RemoteOutcome {
        match self.status.as_deref() {
            Some("completed") | Some("done") => {
                let result = self.result.clone().unwrap_or_default();
                RemoteOutcome::Succeeded {
                    wasm_path: result.wasm_path,
                    image_ref: result.image_url.or(result.image_uri),
                }
            }
            Some("failed") => RemoteOutcome::Failed(self.error.clone()),
            Some(other) => RemoteOutcome::InProgress(other.to_string()),
            None => RemoteOutcome::InProgress("unknown".to_string()),
        }
    }
}

/// Client for interacting with the Builder Service
pub struct BuilderClient {
    base_url: String,
    client: reqwest::Client,
}

impl BuilderClient {
    /// Create a new builder client
    pub fn new(builder_url: &str) -> Self {
        Self {
            base_url: builder_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    async fn read_task_id(response: reqwest::Response, endpoint: &str) -> Result<String> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Builder {} returned {}: {}", endpoint, status, body);
        }

        let submitted: SubmitResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse builder {} response", endpoint))?;

        submitted
            .task_id
            .filter(|id| !id.is_empty())
            .with_context(|| format!("Builder {} response has no task_id", endpoint))
    }

    fn file_part(file: &SourceFile) -> Part {
        Part::bytes(file.bytes.clone()).file_name(file.filename.clone())
    }

    /// Submit a build, returning the builder's task id
    pub async fn submit_build(
        &self,
        file: &SourceFile,
        workspace_id: &str,
        app_name: &str,
    ) -> Result<String> {
        let form = Form::new()
            .part("file", Self::file_part(file))
            .text("workspace_id", workspace_id.to_string())
            .text("app_name", app_name.to_string());

        debug!("Submitting build of {} to builder", file.filename);

        let response = self
            .client
            .post(self.url("build"))
            .multipart(form)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        Self::read_task_id(response, "build").await
    }

    /// Submit a push of an already built image, returning the builder's task id
    pub async fn submit_push(&self, payload: &PushPayload) -> Result<String> {
        debug!("Submitting push to {} for {}", payload.registry_url, payload.workspace_id);

        let response = self
            .client
            .post(self.url("push"))
            .json(payload)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        Self::read_task_id(response, "push").await
    }

    /// Submit a combined build and push, returning the builder's task id
    pub async fn submit_build_and_push(
        &self,
        file: &SourceFile,
        payload: &BuildAndPushPayload,
    ) -> Result<String> {
        let form = Form::new()
            .part("file", Self::file_part(file))
            .text("registry_url", payload.registry_url.clone())
            .text("username", payload.username.clone())
            .text("password", payload.password.clone())
            .text("tag", payload.tag.clone())
            .text("workspace_id", payload.workspace_id.clone())
            .text("app_name", payload.app_name.clone());

        let response = self
            .client
            .post(self.url("build-and-push"))
            .multipart(form)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        Self::read_task_id(response, "build-and-push").await
    }

    /// Current state of a builder task
    pub async fn task_status(&self, remote_task_id: &str, workspace_id: &str) -> Result<RemoteTaskStatus> {
        let response = self
            .client
            .get(self.url(&format!("tasks/{}", remote_task_id)))
            .query(&[("workspace_id", workspace_id)])
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to fetch builder task status: {}", response.status());
        }

        response
            .json()
            .await
            .context("Failed to parse builder task status")
    }

    pub async fn scaffold(&self, request: &ScaffoldRequest) -> Result<ScaffoldResponse> {
        let response = self
            .client
            .post(self.url("scaffold"))
            .json(request)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Builder scaffold returned {}", response.status());
        }

        response
            .json()
            .await
            .context("Failed to parse scaffold response")
    }

    /// One deploy request; readiness retries are the caller's concern
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployResponse> {
        let response = self
            .client
            .post(self.url("deploy"))
            .json(request)
            .timeout(DEPLOY_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Builder deploy returned {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse deploy response")
    }

    /// Remove a deployed app. Returns false when the builder does not know it.
    pub async fn undeploy(&self, app_name: &str, namespace: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.url(&format!("deploy/{}", app_name)))
            .query(&[("namespace", namespace)])
            .timeout(DEPLOY_TIMEOUT)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }

        if !response.status().is_success() {
            anyhow::bail!("Builder undeploy returned {}", response.status());
        }

        Ok(true)
    }
}
