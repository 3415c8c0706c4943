//! Build task lifecycle: submission, dispatch to the builder and polling
//!
//! Every submission is recorded as a [`BuildTask`] before anything is sent to
//! the builder. A supervised background sequence then submits the work, polls
//! the builder until the task reaches a terminal state and writes that state
//! back locally, whichever endpoint was used.

use crate::blob::{build_source_key, BlobStore};
use crate::builder_client::{
    normalize_credentials, BuildAndPushPayload, BuilderClient, PushPayload, RemoteOutcome,
    SourceFile,
};
use crate::catalog::Catalog;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    BuildAndPushRequest, BuildResponse, DeployRequest, DeployResponse, PushRequest,
    ScaffoldRequest, ScaffoldResponse, TaskStatusResponse, WorkspaceTaskItem,
    WorkspaceTasksResponse,
};
use crate::storage::FieldUpdate;
use chrono::Utc;
use faas_common::{ids, BuildTask, FunctionStatus, TaskKind, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Tag value that asks for a tag derived from the task id
pub const DERIVED_TAG_SENTINEL: &str = "sha256";

/// Polling and deploy timing
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub readiness_delay: Duration,
    pub default_workspace_id: String,
}

/// What the background sequence sends to the builder
#[derive(Debug, Clone)]
enum Submission {
    Build { file: SourceFile },
    Push { payload: PushPayload },
    BuildAndPush { file: SourceFile, payload: BuildAndPushPayload },
}

impl Submission {
    /// Image reference to record when the builder reports none
    fn fallback_image(&self) -> Option<String> {
        match self {
            Submission::BuildAndPush { payload, .. } if !payload.registry_url.is_empty() => {
                Some(format!("{}:{}", payload.registry_url, payload.tag))
            }
            _ => None,
        }
    }
}

/// Keep only the final path segment of an uploaded file name
fn sanitize_filename(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or_default().trim()
}

/// Accept `.py` and `.zip` uploads only
pub fn validate_filename(filename: &str) -> ApiResult<String> {
    let name = sanitize_filename(filename);
    if name.is_empty() {
        return Err(ApiError::invalid_field("file", "Filename is required"));
    }
    if !(name.ends_with(".py") || name.ends_with(".zip")) {
        return Err(ApiError::invalid_field(
            "file",
            format!("Unsupported file type '{}': only .py or .zip files are accepted", name),
        ));
    }
    Ok(name.to_string())
}

/// The tag actually pushed: the sentinel becomes `task-{task_id}`
pub fn effective_tag(tag: &str, task_id: &str) -> String {
    let tag = tag.trim();
    if tag.is_empty() || tag == DERIVED_TAG_SENTINEL {
        format!("task-{}", task_id)
    } else {
        tag.to_string()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn describe_ceiling(ceiling: Duration) -> String {
    let secs = ceiling.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{:?}", ceiling)
    }
}

fn builder_unavailable(err: anyhow::Error) -> ApiError {
    ApiError::downstream(
        "BUILDER_UNAVAILABLE",
        format!("Builder service unavailable: {:#}", err),
    )
}

/// Drives build, push and deploy submissions through the builder
#[derive(Clone)]
pub struct TaskEngine {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    builder: Arc<BuilderClient>,
    settings: TaskSettings,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskEngine {
    pub fn new(
        catalog: Catalog,
        blobs: Arc<dyn BlobStore>,
        builder: Arc<BuilderClient>,
        settings: TaskSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            blobs,
            builder,
            settings,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    fn workspace_or_default(&self, workspace_id: Option<String>) -> String {
        non_blank(workspace_id).unwrap_or_else(|| self.settings.default_workspace_id.clone())
    }

    /// Store an uploaded source under the task's build prefix
    async fn store_source(&self, workspace_id: &str, task_id: &str, file: &SourceFile) -> ApiResult<String> {
        let key = build_source_key(workspace_id, task_id, &file.filename);
        self.blobs.put(&key, file.bytes.clone()).await?;
        Ok(key)
    }

    /// Accept a source upload and build it in the background
    pub async fn submit_build(
        &self,
        mut file: SourceFile,
        app_name: Option<String>,
        workspace_id: Option<String>,
    ) -> ApiResult<BuildResponse> {
        file.filename = validate_filename(&file.filename)?;

        let workspace_id = self.workspace_or_default(workspace_id);
        let task_id = ids::task_id();
        let app_name = non_blank(app_name).unwrap_or_else(ids::app_name);

        let source_key = self.store_source(&workspace_id, &task_id, &file).await?;

        let mut task = BuildTask::new(task_id.clone(), workspace_id, app_name, TaskKind::Build);
        task.source_code_path = Some(source_key.clone());
        self.catalog.create_task(&task).await?;

        info!(
            "Build task {} created for {} ({} bytes)",
            task_id,
            task.app_name,
            file.bytes.len()
        );
        self.spawn(task, Submission::Build { file });

        Ok(BuildResponse {
            task_id,
            status: TaskStatus::Pending,
            message: "Build task created".to_string(),
            source_s3_path: Some(source_key),
        })
    }

    /// Push an existing source/image to a registry in the background
    pub async fn submit_push(&self, request: PushRequest) -> ApiResult<BuildResponse> {
        if request.registry_url.trim().is_empty() {
            return Err(ApiError::invalid_field("registry_url", "Registry URL is required"));
        }

        let workspace_id = self.workspace_or_default(request.workspace_id);
        let task_id = ids::task_id();
        let (username, password) =
            normalize_credentials(&request.username, request.password.as_deref());

        let mut task = BuildTask::new(task_id.clone(), workspace_id.clone(), ids::app_name(), TaskKind::Push);
        task.source_code_path = non_blank(request.s3_source_path.clone());
        self.catalog.create_task(&task).await?;

        let payload = PushPayload {
            registry_url: request.registry_url,
            username,
            password,
            tag: request.tag,
            workspace_id,
            s3_source_path: request.s3_source_path.unwrap_or_default(),
        };

        info!("Push task {} created for {}", task_id, payload.registry_url);
        self.spawn(task, Submission::Push { payload });

        Ok(BuildResponse {
            task_id,
            status: TaskStatus::Pending,
            message: "Push task created".to_string(),
            source_s3_path: None,
        })
    }

    /// Build and push in one builder task
    pub async fn submit_build_and_push(
        &self,
        mut file: SourceFile,
        request: BuildAndPushRequest,
    ) -> ApiResult<BuildResponse> {
        file.filename = validate_filename(&file.filename)?;
        if request.registry_url.trim().is_empty() {
            return Err(ApiError::invalid_field("registry_url", "Registry URL is required"));
        }

        let workspace_id = self.workspace_or_default(request.workspace_id);
        let task_id = ids::task_id();
        let app_name = non_blank(request.app_name).unwrap_or_else(ids::app_name);

        let source_key = self.store_source(&workspace_id, &task_id, &file).await?;

        let mut task = BuildTask::new(
            task_id.clone(),
            workspace_id.clone(),
            app_name.clone(),
            TaskKind::BuildAndPush,
        );
        task.source_code_path = Some(source_key.clone());
        self.catalog.create_task(&task).await?;

        let (username, password) =
            normalize_credentials(&request.username, request.password.as_deref());
        let payload = BuildAndPushPayload {
            registry_url: request.registry_url,
            username,
            password,
            tag: effective_tag(&request.tag, &task_id),
            workspace_id,
            app_name,
        };

        info!(
            "Build-and-push task {} created, tag {}",
            task_id, payload.tag
        );
        self.spawn(task, Submission::BuildAndPush { file, payload });

        Ok(BuildResponse {
            task_id,
            status: TaskStatus::Pending,
            message: "Build and push task created".to_string(),
            source_s3_path: Some(source_key),
        })
    }

    fn spawn(&self, task: BuildTask, submission: Submission) {
        let engine = self.clone();
        self.tracker.spawn(async move {
            engine.drive(task, submission).await;
        });
    }

    async fn submit(&self, task: &BuildTask, submission: &Submission) -> anyhow::Result<String> {
        match submission {
            Submission::Build { file } => {
                self.builder
                    .submit_build(file, &task.workspace_id, &task.app_name)
                    .await
            }
            Submission::Push { payload } => self.builder.submit_push(payload).await,
            Submission::BuildAndPush { file, payload } => {
                self.builder.submit_build_and_push(file, payload).await
            }
        }
    }

    /// Write the task's current state, logging instead of failing
    async fn persist(&self, task: &mut BuildTask) {
        task.updated_at = Utc::now();
        match self.catalog.update_task(task).await {
            Ok(true) => {}
            Ok(false) => warn!("Task {} disappeared before its state could be saved", task.task_id),
            Err(e) => error!("Failed to save task {}: {}", task.task_id, e),
        }
    }

    async fn fail(&self, task: &mut BuildTask, message: String) {
        error!("{} task {} failed: {}", task.kind.label(), task.task_id, message);
        task.status = TaskStatus::Failed;
        task.error_message = Some(message);
        self.persist(task).await;
    }

    /// Submit to the builder, then poll until a terminal state or the attempt ceiling
    async fn drive(&self, mut task: BuildTask, submission: Submission) {
        let kind = task.kind.label();

        let submitted = tokio::select! {
            _ = self.shutdown.cancelled() => {
                warn!("{} task {} abandoned by shutdown before submission", kind, task.task_id);
                return;
            }
            result = self.submit(&task, &submission) => result,
        };

        let remote_id = match submitted {
            Ok(id) => id,
            Err(e) => {
                self.fail(&mut task, format!("Failed to submit to builder: {:#}", e))
                    .await;
                return;
            }
        };

        info!("{} task {} submitted to builder: {}", kind, task.task_id, remote_id);
        task.status = TaskStatus::Running;
        task.remote_task_id = Some(remote_id.clone());
        self.persist(&mut task).await;

        let max_attempts = self.settings.max_poll_attempts;
        for attempt in 1..=max_attempts {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    warn!(
                        "{} task {} interrupted by shutdown while polling (attempt {}/{})",
                        kind, task.task_id, attempt, max_attempts
                    );
                    return;
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            let remote = match self.builder.task_status(&remote_id, &task.workspace_id).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(
                        "{} task {} status poll failed (attempt {}/{}): {:#}",
                        kind, task.task_id, attempt, max_attempts, e
                    );
                    continue;
                }
            };

            info!(
                "{} task {} status: {} (attempt {}/{})",
                kind,
                task.task_id,
                remote.status.as_deref().unwrap_or("unknown"),
                attempt,
                max_attempts
            );

            match remote.outcome() {
                RemoteOutcome::Succeeded { wasm_path, image_ref } => {
                    task.status = TaskStatus::Completed;
                    task.wasm_path = wasm_path;
                    task.image_url = image_ref.or_else(|| submission.fallback_image());
                    task.error_message = None;
                    self.persist(&mut task).await;
                    info!(
                        "{} task {} completed (wasm: {:?}, image: {:?})",
                        kind, task.task_id, task.wasm_path, task.image_url
                    );
                    return;
                }
                RemoteOutcome::Failed(message) => {
                    let message = message.unwrap_or_else(|| format!("{} failed", kind));
                    self.fail(&mut task, message).await;
                    return;
                }
                RemoteOutcome::InProgress(state) => {
                    debug!("{} task {} still {}", kind, task.task_id, state);
                }
            }
        }

        let ceiling = self.settings.poll_interval * max_attempts;
        self.fail(
            &mut task,
            format!("{} timeout ({} exceeded)", kind, describe_ceiling(ceiling)),
        )
        .await;
    }

    /// Current state of a task, looked up by id alone
    pub async fn task_status(&self, task_id: &str) -> ApiResult<TaskStatusResponse> {
        let task = self
            .catalog
            .find_task(task_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Task not found: {}", task_id)))?;
        Ok(TaskStatusResponse::from(&task))
    }

    /// All tasks of a workspace, most recent first
    pub async fn workspace_tasks(&self, workspace_id: &str) -> ApiResult<WorkspaceTasksResponse> {
        let tasks: Vec<WorkspaceTaskItem> = self
            .catalog
            .list_tasks(workspace_id)
            .await?
            .iter()
            .map(WorkspaceTaskItem::from)
            .collect();

        Ok(WorkspaceTasksResponse {
            workspace_id: workspace_id.to_string(),
            count: tasks.len(),
            tasks,
        })
    }

    /// Relay a manifest request; builder failures come back as `success = false`
    pub async fn scaffold(&self, request: ScaffoldRequest) -> ScaffoldResponse {
        match self.builder.scaffold(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Scaffold request failed: {:#}", e);
                ScaffoldResponse {
                    success: false,
                    yaml_content: None,
                    file_path: None,
                    error: Some(format!("HTTP error: {:#}", e)),
                }
            }
        }
    }

    /// Deploy through the builder, re-asking once if the endpoint is not ready
    pub async fn deploy(&self, request: DeployRequest) -> ApiResult<DeployResponse> {
        info!(
            "Deploying {} to namespace {}",
            request.image_ref, request.namespace
        );

        let first = self.builder.deploy(&request).await.map_err(builder_unavailable)?;

        let response = match (first.reachable_endpoint(), non_blank(first.app_name.clone())) {
            (None, Some(app_name)) => {
                info!(
                    "Endpoint of {} not ready, asking again in {:?}",
                    app_name, self.settings.readiness_delay
                );
                tokio::time::sleep(self.settings.readiness_delay).await;

                let mut retry = request.clone();
                retry.app_name = Some(app_name);
                self.builder.deploy(&retry).await.map_err(builder_unavailable)?
            }
            _ => first,
        };

        if let Some(function_id) = non_blank(request.function_id) {
            self.bind_deployment(&function_id, &response).await;
        }

        Ok(response)
    }

    /// Point the function at its new deployment; failures are logged only
    async fn bind_deployment(&self, function_id: &str, response: &DeployResponse) {
        let Some(endpoint) = response.reachable_endpoint() else {
            debug!("Deploy of {} returned no endpoint, function left unchanged", function_id);
            return;
        };

        let function = match self.catalog.find_function(function_id).await {
            Ok(Some(function)) => function,
            Ok(None) => {
                warn!("Deployed function {} is not registered", function_id);
                return;
            }
            Err(e) => {
                warn!("Failed to look up deployed function {}: {}", function_id, e);
                return;
            }
        };

        let updates = match serde_json::to_value(Utc::now()) {
            Ok(now) => vec![
                FieldUpdate::set("invocationUrl", endpoint),
                FieldUpdate::set("lastDeployed", now),
                FieldUpdate::set("status", FunctionStatus::Active.as_str()),
            ],
            Err(e) => {
                warn!("Failed to encode deploy time: {}", e);
                return;
            }
        };

        match self
            .catalog
            .update_function(&function.workspace_id, &function.id, updates)
            .await
        {
            Ok(_) => info!("Function {} bound to {}", function.id, endpoint),
            Err(e) => warn!("Failed to record deployment of {}: {}", function.id, e),
        }
    }

    /// Stop accepting work and signal running sequences to stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
    }

    /// Wait for every background sequence to finish; call after [`shutdown`](Self::shutdown)
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        assert_eq!(validate_filename("main.py").unwrap(), "main.py");
        assert_eq!(validate_filename("dir/app.zip").unwrap(), "app.zip");
        assert_eq!(validate_filename("..\\evil.py").unwrap(), "evil.py");

        let err = validate_filename("notes.txt").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(validate_filename("").is_err());
        assert!(validate_filename("dir/").is_err());
    }

    #[test]
    fn test_effective_tag() {
        assert_eq!(effective_tag("sha256", "abc"), "task-abc");
        assert_eq!(effective_tag("", "abc"), "task-abc");
        assert_eq!(effective_tag("v1.2", "abc"), "v1.2");
    }

    #[test]
    fn test_describe_ceiling() {
        assert_eq!(describe_ceiling(Duration::from_secs(600)), "10 minutes");
        assert_eq!(describe_ceiling(Duration::from_millis(200)), "200ms");
    }

    #[test]
    fn test_fallback_image_only_for_build_and_push() {
        let file = SourceFile {
            filename: "main.py".to_string(),
            bytes: vec![],
        };
        let payload = BuildAndPushPayload {
            registry_url: "reg.example/app".to_string(),
            username: String::new(),
            password: String::new(),
            tag: "task-1".to_string(),
            workspace_id: "ws-1".to_string(),
            app_name: "app-1".to_string(),
        };

        assert_eq!(
            Submission::BuildAndPush {
                file: file.clone(),
                payload
            }
            .fallback_image()
            .as_deref(),
            Some("reg.example/app:task-1")
        );
        assert!(Submission::Build { file }.fallback_image().is_none());
    }
}
