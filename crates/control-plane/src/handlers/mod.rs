//! HTTP handlers, grouped by resource

pub mod builds;
pub mod functions;
pub mod telemetry;
pub mod workspaces;

use axum::{response::IntoResponse, Json};
use serde_json::json;

const SERVICE_NAME: &str = "faas-control-plane";

/// Status banner
pub async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}
