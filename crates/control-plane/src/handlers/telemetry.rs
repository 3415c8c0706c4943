//! Prometheus and Loki proxy routes

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use std::sync::Arc;

use crate::{
    error::ApiResult,
    models::{LokiLogsQuery, LokiLogsResponse, MetricsResponse},
    AppState,
};

pub async fn function_metrics_handler(
    State(state): State<Arc<AppState>>,
    Path(function_id): Path<String>,
) -> ApiResult<Json<MetricsResponse>> {
    Ok(Json(state.telemetry.function_metrics(&function_id).await?))
}

pub async fn loki_logs_handler(
    State(state): State<Arc<AppState>>,
    Path(function_id): Path<String>,
    query: Result<Query<LokiLogsQuery>, QueryRejection>,
) -> ApiResult<Json<LokiLogsResponse>> {
    let Query(query) = query?;
    let logs = state
        .telemetry
        .function_logs(&function_id, query.limit, query.minutes)
        .await?;
    Ok(Json(logs))
}
