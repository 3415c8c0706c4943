//! Build, push, scaffold and deploy routes backed by the Builder Service

use axum::{
    extract::{multipart::MultipartRejection, rejection::JsonRejection, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::{
    builder_client::{SourceFile, AMBIENT_USERNAME},
    error::{ApiError, ApiResult},
    models::{
        BuildAndPushRequest, BuildResponse, DeployRequest, DeployResponse, PushRequest,
        ScaffoldRequest, ScaffoldResponse, TaskStatusResponse, WorkspaceTasksResponse,
    },
    tasks::DERIVED_TAG_SENTINEL,
    AppState,
};

/// A multipart upload: the `file` part plus every text field
struct Upload {
    file: Option<SourceFile>,
    fields: HashMap<String, String>,
}

impl Upload {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut upload = Upload {
            file: None,
            fields: HashMap::new(),
        };

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                upload.file = Some(SourceFile {
                    filename,
                    bytes: bytes.to_vec(),
                });
            } else if !name.is_empty() {
                let value = field.text().await?;
                upload.fields.insert(name, value);
            }
        }

        Ok(upload)
    }

    fn take_file(&mut self) -> ApiResult<SourceFile> {
        self.file
            .take()
            .ok_or_else(|| ApiError::invalid_field("file", "Filename is required"))
    }

    /// A text field, `None` when absent or blank
    fn field(&mut self, name: &str) -> Option<String> {
        self.fields
            .remove(name)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Accept a `.py` or `.zip` upload and build it in the background
pub async fn build_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<BuildResponse>)> {
    let mut upload = Upload::read(multipart?).await?;
    let file = upload.take_file()?;
    info!("Build requested for {} ({} bytes)", file.filename, file.bytes.len());

    let response = state
        .tasks
        .submit_build(file, upload.field("app_name"), upload.field("workspace_id"))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn push_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<BuildResponse>)> {
    let Json(request) = payload?;
    info!("Push requested to {}", request.registry_url);

    let response = state.tasks.submit_push(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn build_and_push_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<BuildResponse>)> {
    let mut upload = Upload::read(multipart?).await?;
    let file = upload.take_file()?;

    let request = BuildAndPushRequest {
        registry_url: upload
            .field("registry_url")
            .ok_or_else(|| ApiError::invalid_field("registry_url", "Registry URL is required"))?,
        username: upload
            .field("username")
            .unwrap_or_else(|| AMBIENT_USERNAME.to_string()),
        password: upload.field("password"),
        tag: upload
            .field("tag")
            .unwrap_or_else(|| DERIVED_TAG_SENTINEL.to_string()),
        app_name: upload.field("app_name"),
        workspace_id: upload.field("workspace_id"),
    };
    info!(
        "Build and push requested for {} to {}",
        file.filename, request.registry_url
    );

    let response = state.tasks.submit_build_and_push(file, request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Task state, without touching the builder
pub async fn task_status_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskStatusResponse>> {
    Ok(Json(state.tasks.task_status(&task_id).await?))
}

pub async fn workspace_tasks_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<WorkspaceTasksResponse>> {
    Ok(Json(state.tasks.workspace_tasks(&workspace_id).await?))
}

pub async fn scaffold_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ScaffoldRequest>, JsonRejection>,
) -> ApiResult<Json<ScaffoldResponse>> {
    let Json(request) = payload?;
    Ok(Json(state.tasks.scaffold(request).await))
}

pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<Json<DeployResponse>> {
    let Json(request) = payload?;
    Ok(Json(state.tasks.deploy(request).await?))
}
