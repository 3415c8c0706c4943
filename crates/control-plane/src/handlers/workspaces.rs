//! Workspace routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;

use crate::{
    error::ApiResult,
    models::{CreateWorkspaceRequest, UpdateWorkspaceRequest, WorkspaceView},
    AppState,
};

pub async fn create_workspace_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateWorkspaceRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<WorkspaceView>)> {
    let Json(request) = payload?;
    info!("Creating workspace: {}", request.name);

    let workspace = state.resources.create_workspace(request).await?;
    Ok((StatusCode::CREATED, Json(workspace.into())))
}

pub async fn list_workspaces_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<WorkspaceView>>> {
    let workspaces = state.resources.list_workspaces().await?;
    Ok(Json(workspaces.into_iter().map(WorkspaceView::from).collect()))
}

pub async fn get_workspace_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<WorkspaceView>> {
    let workspace = state.resources.get_workspace(&workspace_id).await?;
    Ok(Json(workspace.into()))
}

pub async fn update_workspace_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    payload: Result<Json<UpdateWorkspaceRequest>, JsonRejection>,
) -> ApiResult<Json<WorkspaceView>> {
    let Json(request) = payload?;
    let workspace = state
        .resources
        .update_workspace(&workspace_id, request)
        .await?;
    Ok(Json(workspace.into()))
}

/// Deletes the workspace with everything it owns
pub async fn delete_workspace_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<StatusCode> {
    info!("Deleting workspace: {}", workspace_id);
    state.resources.delete_workspace(&workspace_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
