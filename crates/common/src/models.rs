//! Records persisted by the control plane

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Workspace a caller falls back to when a build submission names none
pub const DEFAULT_WORKSPACE_ID: &str = "ws-default";

/// Tenant boundary owning functions and build tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub function_count: i64,
    #[serde(default, rename = "invocations24h")]
    pub invocations_24h: i64,
    /// Percentage of failed invocations across the workspace's functions
    #[serde(default)]
    pub error_rate: Decimal,
}

impl Workspace {
    /// Create a workspace with zeroed counters
    pub fn new(id: String, name: String, description: Option<String>) -> Self {
        Self {
            id,
            name,
            description: description.unwrap_or_default(),
            created_at: Utc::now(),
            function_count: 0,
            invocations_24h: 0,
            error_rate: Decimal::ZERO,
        }
    }
}

/// Lifecycle status of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionStatus {
    Active,
    Disabled,
    Building,
    Deploying,
    Failed,
}

impl FunctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionStatus::Active => "active",
            FunctionStatus::Disabled => "disabled",
            FunctionStatus::Building => "building",
            FunctionStatus::Deploying => "deploying",
            FunctionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(FunctionStatus::Active),
            "disabled" => Ok(FunctionStatus::Disabled),
            "building" => Ok(FunctionStatus::Building),
            "deploying" => Ok(FunctionStatus::Deploying),
            "failed" => Ok(FunctionStatus::Failed),
            other => Err(format!(
                "Invalid status '{}': expected one of active, disabled, building, deploying, failed",
                other
            )),
        }
    }
}

/// A deployable unit of code with its HTTP invocation config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub runtime: String,

    /// Memory limit in MB (128-1024)
    pub memory: u32,

    /// Invocation timeout in seconds (1-900)
    pub timeout: u32,

    pub http_methods: Vec<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,

    /// Base64 encoded source
    pub code: String,

    #[serde(default)]
    pub invocation_url: Option<String>,
    pub status: FunctionStatus,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub last_deployed: Option<DateTime<Utc>>,

    #[serde(default, rename = "invocations24h")]
    pub invocations_24h: i64,
    #[serde(default, rename = "errors24h")]
    pub errors_24h: i64,

    /// Cumulative mean duration in milliseconds
    #[serde(default)]
    pub avg_duration: Decimal,
}

/// Fold one more duration into a cumulative (unweighted) mean
pub fn next_average(prev_avg: Decimal, prev_count: i64, duration: Decimal) -> Decimal {
    let prev_count = Decimal::from(prev_count.max(0));
    ((prev_avg * prev_count + duration) / (prev_count + Decimal::ONE)).normalize()
}

/// Outcome of one invocation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Severity attached to an execution log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Immutable record of a single invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub id: String,
    pub function_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: ExecutionStatus,

    /// Wall-clock duration in milliseconds
    pub duration: Decimal,

    pub status_code: u16,
    #[serde(default)]
    pub request_body: Option<serde_json::Value>,
    #[serde(default)]
    pub response_body: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    pub level: LogLevel,
}

/// Build task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task recorded, not yet accepted by the builder
    Pending,
    /// Builder accepted the task and is working on it
    Running,
    /// Builder reported success
    Completed,
    /// Builder reported failure, or the task could not be driven to completion
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Which builder endpoint a task was submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Build,
    Push,
    BuildAndPush,
}

impl TaskKind {
    /// Human label used in log lines and error messages
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Build => "Build",
            TaskKind::Push => "Push",
            TaskKind::BuildAndPush => "Build-and-push",
        }
    }
}

/// A build/push submission tracked through its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTask {
    pub task_id: String,
    pub workspace_id: String,
    pub app_name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,

    /// Blob key of the uploaded source
    #[serde(default)]
    pub source_code_path: Option<String>,

    #[serde(default)]
    pub wasm_path: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,

    /// Task handle issued by the builder service
    #[serde(default)]
    pub remote_task_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildTask {
    /// Create a new pending task
    pub fn new(task_id: String, workspace_id: String, app_name: String, kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            workspace_id,
            app_name,
            kind,
            status: TaskStatus::Pending,
            source_code_path: None,
            wasm_path: None,
            image_url: None,
            error_message: None,
            remote_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
