//! Shared helpers for the integration tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use control_plane::{
    blob::InMemoryBlobStore, config::Config, create_router, storage::InMemoryMetadataStore,
    AppState,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt; // for `oneshot`

pub const BOUNDARY: &str = "----faas-test-boundary";

/// A router over in-memory backends, with handles to inspect them
pub struct TestApp {
    pub router: Router,
    pub blobs: Arc<InMemoryBlobStore>,
    pub shutdown: CancellationToken,
}

pub fn test_app(config: Config) -> TestApp {
    test_app_with_function_client(config, reqwest::Client::new())
}

/// Like [`test_app`], calling functions through the given client
pub fn test_app_with_function_client(config: Config, client: reqwest::Client) -> TestApp {
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let shutdown = CancellationToken::new();

    let state =
        AppState::with_function_client(config, metadata, blobs.clone(), shutdown.clone(), client);

    TestApp {
        router: create_router(state),
        blobs,
        shutdown,
    }
}

/// Test config pointed at a mock Builder Service
pub fn config_with_builder(builder_url: &str) -> Config {
    let mut config = Config::for_testing();
    config.builder_service_url = builder_url.to_string();
    config
}

impl TestApp {
    pub async fn request(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.request(
            Request::builder()
                .uri(uri)
                .method("DELETE")
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn send_json(&self, method: &str, uri: &str, body: &Value) -> (StatusCode, Value) {
        self.request(
            Request::builder()
                .uri(uri)
                .method(method)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(body).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> (StatusCode, Value) {
        self.send_json("POST", uri, body).await
    }

    pub async fn patch_json(&self, uri: &str, body: &Value) -> (StatusCode, Value) {
        self.send_json("PATCH", uri, body).await
    }

    pub async fn post_multipart(
        &self,
        uri: &str,
        file: Option<(&str, &[u8])>,
        fields: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        self.request(
            Request::builder()
                .uri(uri)
                .method("POST")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart_body(file, fields)))
                .unwrap(),
        )
        .await
    }

    /// Create a workspace and return its id
    pub async fn create_workspace(&self, name: &str) -> String {
        let (status, body) = self
            .post_json("/api/workspaces", &serde_json::json!({ "name": name }))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    /// Create a function (base64 of `print("hi")`) and return its id
    pub async fn create_function(&self, workspace_id: &str, name: &str) -> String {
        let (status, body) = self
            .post_json(
                &format!("/api/workspaces/{}/functions", workspace_id),
                &serde_json::json!({ "name": name, "code": "cHJpbnQoImhpIik=" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["id"].as_str().unwrap().to_string()
    }

    /// Poll a task until it leaves pending/running
    pub async fn wait_for_task(&self, task_id: &str) -> Value {
        for _ in 0..500 {
            let (status, body) = self.get(&format!("/api/v1/tasks/{}", task_id)).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == "completed" || body["status"] == "failed" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached a terminal state", task_id);
    }
}

pub fn multipart_body(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();

    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }

    if let Some((filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}
