//! API error type and its JSON rendering

use axum::{
    extract::multipart::{MultipartError, MultipartRejection},
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotDeployed(String),

    /// An external collaborator could not be reached or refused the request
    #[error("{message}")]
    Downstream { code: &'static str, message: String },

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn downstream(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Downstream {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } | ApiError::NotDeployed(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Downstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::NotDeployed(_) => "NOT_DEPLOYED",
            ApiError::Downstream { code, .. } => code,
            ApiError::Timeout(_) => "TIMEOUT",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let ApiError::Validation {
            field: Some(field), ..
        } = &self
        {
            body["field"] = json!(field);
        }

        (self.status(), Json(json!({ "error": body }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("Internal error: {:#}", err);
        ApiError::Internal(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::validation(format!("Malformed multipart body: {}", err.body_text()))
    }
}

impl From<faas_common::Error> for ApiError {
    fn from(err: faas_common::Error) -> Self {
        error!("Storage error: {}", err);
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_validation_error_carries_field() {
        let (status, body) = render(ApiError::invalid_field("memory", "Memory must be between 128 and 1024 MB")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["field"], "memory");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (status, body) = render(ApiError::NotFound("Task not found: x".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["message"], "Task not found: x");
        assert!(body["error"].get("field").is_none());

        let (status, body) = render(ApiError::downstream("PROMETHEUS_CONNECTION_ERROR", "down")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "PROMETHEUS_CONNECTION_ERROR");

        assert_eq!(ApiError::Timeout("t".into()).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::NotDeployed("n".into()).status(), StatusCode::BAD_REQUEST);
    }
}
