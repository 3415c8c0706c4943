//! Function routes, including invocation and execution logs

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;

use crate::{
    error::ApiResult,
    models::{
        CreateFunctionRequest, ExecutionLogView, FunctionView, InvocationResult, LogsQuery,
        LogsResponse, UpdateFunctionRequest,
    },
    AppState,
};

pub async fn create_function_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    payload: Result<Json<CreateFunctionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<FunctionView>)> {
    let Json(request) = payload?;
    info!("Creating function {} in workspace {}", request.name, workspace_id);

    let function = state
        .resources
        .create_function(&workspace_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(function.into())))
}

pub async fn list_functions_handler(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Vec<FunctionView>>> {
    let functions = state.resources.list_functions(&workspace_id).await?;
    Ok(Json(functions.into_iter().map(FunctionView::from).collect()))
}

pub async fn get_function_handler(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, function_id)): Path<(String, String)>,
) -> ApiResult<Json<FunctionView>> {
    let function = state
        .resources
        .get_function(&workspace_id, &function_id)
        .await?;
    Ok(Json(function.into()))
}

pub async fn update_function_handler(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, function_id)): Path<(String, String)>,
    payload: Result<Json<UpdateFunctionRequest>, JsonRejection>,
) -> ApiResult<Json<FunctionView>> {
    let Json(request) = payload?;
    let function = state
        .resources
        .update_function(&workspace_id, &function_id, request)
        .await?;
    Ok(Json(function.into()))
}

pub async fn delete_function_handler(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, function_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    info!("Deleting function {} from workspace {}", function_id, workspace_id);
    state
        .resources
        .delete_function(&workspace_id, &function_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Calls the function with the raw request body; a non-JSON body is sent as `{}`
pub async fn invoke_function_handler(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, function_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<InvocationResult>> {
    let result = state
        .invocations
        .invoke(&workspace_id, &function_id, &body)
        .await?;
    Ok(Json(result))
}

pub async fn function_logs_handler(
    State(state): State<Arc<AppState>>,
    Path((workspace_id, function_id)): Path<(String, String)>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<Json<LogsResponse>> {
    let Query(query) = query?;
    let logs: Vec<ExecutionLogView> = state
        .resources
        .list_logs(&workspace_id, &function_id, query.limit)
        .await?
        .into_iter()
        .map(ExecutionLogView::from)
        .collect();

    Ok(Json(LogsResponse {
        total: logs.len(),
        logs,
    }))
}
