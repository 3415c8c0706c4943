//! Request and response bodies of the HTTP API

use chrono::{DateTime, Utc};
use faas_common::{BuildTask, ExecutionLog, ExecutionStatus, Function, FunctionStatus, LogLevel, TaskStatus, Workspace};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ===== Workspaces =====

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateWorkspaceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Workspace as returned by the API, with decimals rendered as numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub function_count: i64,
    #[serde(rename = "invocations24h")]
    pub invocations_24h: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub error_rate: Decimal,
}

impl From<Workspace> for WorkspaceView {
    fn from(ws: Workspace) -> Self {
        Self {
            id: ws.id,
            name: ws.name,
            description: ws.description,
            created_at: ws.created_at,
            function_count: ws.function_count,
            invocations_24h: ws.invocations_24h,
            error_rate: ws.error_rate,
        }
    }
}

// ===== Functions =====

fn default_runtime() -> String {
    "Python 3.12".to_string()
}

fn default_memory() -> u32 {
    256
}

fn default_timeout() -> u32 {
    30
}

fn default_http_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFunctionRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    #[serde(default = "default_http_methods")]
    pub http_methods: Vec<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    pub code: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFunctionRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub runtime: Option<String>,
    pub memory: Option<u32>,
    pub timeout: Option<u32>,
    pub http_methods: Option<Vec<String>>,
    pub environment_variables: Option<BTreeMap<String, String>>,
    pub code: Option<String>,
    pub invocation_url: Option<String>,
    pub status: Option<String>,
}

/// Function configuration as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionView {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub description: String,
    pub runtime: String,
    pub memory: u32,
    pub timeout: u32,
    pub http_methods: Vec<String>,
    pub environment_variables: BTreeMap<String, String>,
    pub code: String,
    pub invocation_url: Option<String>,
    pub status: FunctionStatus,
    pub last_modified: DateTime<Utc>,
    pub last_deployed: Option<DateTime<Utc>>,
    #[serde(rename = "invocations24h")]
    pub invocations_24h: i64,
    #[serde(rename = "errors24h")]
    pub errors_24h: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub avg_duration: Decimal,
}

impl From<Function> for FunctionView {
    fn from(f: Function) -> Self {
        Self {
            id: f.id,
            workspace_id: f.workspace_id,
            name: f.name,
            description: f.description,
            runtime: f.runtime,
            memory: f.memory,
            timeout: f.timeout,
            http_methods: f.http_methods,
            environment_variables: f.environment_variables,
            code: f.code,
            invocation_url: f.invocation_url,
            status: f.status,
            last_modified: f.last_modified,
            last_deployed: f.last_deployed,
            invocations_24h: f.invocations_24h,
            errors_24h: f.errors_24h,
            avg_duration: f.avg_duration,
        }
    }
}

// ===== Execution logs =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogView {
    pub id: String,
    pub function_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub duration: Decimal,
    pub status_code: u16,
    pub request_body: Option<Value>,
    pub response_body: Option<Value>,
    pub logs: Vec<String>,
    pub level: LogLevel,
}

impl From<ExecutionLog> for ExecutionLogView {
    fn from(log: ExecutionLog) -> Self {
        Self {
            id: log.id,
            function_id: log.function_id,
            timestamp: log.timestamp,
            status: log.status,
            duration: log.duration,
            status_code: log.status_code,
            request_body: log.request_body,
            response_body: log.response_body,
            logs: log.logs,
            level: log.level,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<ExecutionLogView>,
    pub total: usize,
}

/// Outcome of an invocation that received a response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub log_id: String,
    pub status: ExecutionStatus,
    pub status_code: u16,
    /// Milliseconds
    #[serde(with = "rust_decimal::serde::float")]
    pub duration: Decimal,
    pub response: Option<Value>,
}

// ===== Build tasks =====

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_s3_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTaskResult {
    pub wasm_path: Option<String>,
    pub image_url: Option<String>,
    pub file_path: Option<String>,
}

/// The result block, present only for completed tasks
fn task_result(task: &BuildTask) -> Option<BuildTaskResult> {
    (task.status == TaskStatus::Completed).then(|| BuildTaskResult {
        wasm_path: task.wasm_path.clone(),
        image_url: task.image_url.clone(),
        file_path: task.source_code_path.clone(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<BuildTaskResult>,
    pub error: Option<String>,
}

impl From<&BuildTask> for TaskStatusResponse {
    fn from(task: &BuildTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            result: task_result(task),
            error: task.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceTaskItem {
    pub task_id: String,
    pub status: TaskStatus,
    pub app_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<BuildTaskResult>,
    pub error: Option<String>,
}

impl From<&BuildTask> for WorkspaceTaskItem {
    fn from(task: &BuildTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            app_name: task.app_name.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            result: task_result(task),
            error: task.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkspaceTasksResponse {
    pub workspace_id: String,
    pub tasks: Vec<WorkspaceTaskItem>,
    pub count: usize,
}

fn default_username() -> String {
    "AWS".to_string()
}

fn default_tag() -> String {
    "sha256".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRequest {
    pub registry_url: String,
    #[serde(default = "default_username")]
    pub username: String,
    pub password: Option<String>,
    #[serde(default = "default_tag")]
    pub tag: String,
    pub workspace_id: Option<String>,
    pub s3_source_path: Option<String>,
}

/// Fields of a build-and-push submission besides the file
#[derive(Debug, Clone)]
pub struct BuildAndPushRequest {
    pub registry_url: String,
    pub username: String,
    pub password: Option<String>,
    pub tag: String,
    pub app_name: Option<String>,
    pub workspace_id: Option<String>,
}

fn default_replicas() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaffoldRequest {
    pub image_ref: String,
    pub component: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaffoldResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub yaml_content: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub app_name: Option<String>,
    pub namespace: String,
    pub service_account: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub image_ref: String,
    #[serde(default = "default_true")]
    pub enable_autoscaling: bool,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default = "default_true")]
    pub use_spot: bool,
    pub custom_tolerations: Option<Vec<Value>>,
    pub custom_affinity: Option<Value>,
    pub function_id: Option<String>,
}

fn default_service_status() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResponse {
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default = "default_service_status")]
    pub service_status: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub enable_autoscaling: Option<bool>,
    #[serde(default)]
    pub use_spot: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeployResponse {
    /// Endpoint, when the builder reported a non-blank one
    pub fn reachable_endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }
}

// ===== Telemetry =====

#[derive(Debug, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    pub timestamp: f64,
    pub value: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsData {
    pub cpu_total: Option<f64>,
    pub cpu_series: Vec<TimeseriesPoint>,
    pub window_seconds: u64,
    pub instant_query: String,
    pub range_query: String,
    pub raw_instant: Value,
    pub raw_range: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub status: String,
    pub data: MetricsData,
    pub function_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LokiLogsQuery {
    pub limit: Option<u32>,
    pub minutes: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LokiLogEntry {
    /// Nanoseconds since the epoch, as Loki reports it
    pub timestamp: String,
    pub line: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LokiLogsResponse {
    pub logs: Vec<LokiLogEntry>,
    pub total: usize,
    pub function_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::TaskKind;
    use serde_json::json;

    #[test]
    fn test_create_function_defaults() {
        let req: CreateFunctionRequest =
            serde_json::from_value(json!({ "name": "hello", "code": "aGVsbG8=" })).unwrap();

        assert_eq!(req.runtime, "Python 3.12");
        assert_eq!(req.memory, 256);
        assert_eq!(req.timeout, 30);
        assert_eq!(req.http_methods, vec!["GET"]);
        assert!(req.environment_variables.is_empty());
    }

    #[test]
    fn test_views_render_decimals_as_numbers() {
        let mut ws = Workspace::new("ws-1".to_string(), "demo".to_string(), None);
        ws.error_rate = Decimal::new(3333, 2);

        let value = serde_json::to_value(WorkspaceView::from(ws)).unwrap();
        assert!((value["errorRate"].as_f64().unwrap() - 33.33).abs() < 1e-9);
        assert_eq!(value["invocations24h"], 0);
    }

    #[test]
    fn test_task_result_only_when_completed() {
        let mut task = BuildTask::new(
            "t-1".to_string(),
            "ws-1".to_string(),
            "app-1".to_string(),
            TaskKind::Build,
        );
        task.wasm_path = Some("out/app.wasm".to_string());
        assert!(TaskStatusResponse::from(&task).result.is_none());

        task.status = TaskStatus::Completed;
        let response = TaskStatusResponse::from(&task);
        assert_eq!(
            response.result.unwrap().wasm_path.as_deref(),
            Some("out/app.wasm")
        );
    }

    #[test]
    fn test_deploy_response_endpoint() {
        let response: DeployResponse = serde_json::from_value(json!({
            "app_name": "app-1",
            "endpoint": "  "
        }))
        .unwrap();

        assert_eq!(response.service_status, "pending");
        assert!(response.reachable_endpoint().is_none());
    }
}
