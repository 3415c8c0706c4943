//! Workspace and function lifecycle, with validation and cascades

use crate::blob::{build_source_prefix, function_source_key, BlobStore};
use crate::builder_client::BuilderClient;
use crate::catalog::Catalog;
use crate::error::{ApiError, ApiResult};
use crate::invocation::slugify;
use crate::models::{
    CreateFunctionRequest, CreateWorkspaceRequest, UpdateFunctionRequest, UpdateWorkspaceRequest,
};
use crate::storage::FieldUpdate;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use faas_common::{ids, ExecutionLog, Function, FunctionStatus, Workspace};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MIN_MEMORY_MB: u32 = 128;
pub const MAX_MEMORY_MB: u32 = 1024;
pub const MIN_TIMEOUT_SECS: u32 = 1;
pub const MAX_TIMEOUT_SECS: u32 = 900;
pub const DEFAULT_LOG_LIMIT: usize = 100;
pub const MAX_LOG_LIMIT: usize = 1000;

fn validate_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::invalid_field("name", "Name must not be empty"));
    }
    Ok(name.to_string())
}

fn validate_memory(memory: u32) -> ApiResult<()> {
    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&memory) {
        return Err(ApiError::invalid_field(
            "memory",
            format!("Memory must be between {} and {} MB", MIN_MEMORY_MB, MAX_MEMORY_MB),
        ));
    }
    Ok(())
}

fn validate_timeout(timeout: u32) -> ApiResult<()> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout) {
        return Err(ApiError::invalid_field(
            "timeout",
            format!(
                "Timeout must be between {} and {} seconds",
                MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
            ),
        ));
    }
    Ok(())
}

fn validate_methods(methods: &[String]) -> ApiResult<Vec<String>> {
    if methods.is_empty() || methods.iter().any(|m| m.trim().is_empty()) {
        return Err(ApiError::invalid_field(
            "httpMethods",
            "At least one HTTP method is required",
        ));
    }
    Ok(methods.to_vec())
}

/// Decode the base64 source payload
fn decode_code(code: &str) -> ApiResult<Vec<u8>> {
    STANDARD
        .decode(code.trim())
        .map_err(|_| ApiError::invalid_field("code", "Invalid Base64 encoded code"))
}

fn encode<T: serde::Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

/// Whether and where deleted functions' deployments are torn down
#[derive(Debug, Clone)]
pub struct TeardownPolicy {
    pub enabled: bool,
    pub namespace: String,
}

pub struct ResourceService {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    builder: Arc<BuilderClient>,
    teardown: TeardownPolicy,
}

impl ResourceService {
    pub fn new(
        catalog: Catalog,
        blobs: Arc<dyn BlobStore>,
        builder: Arc<BuilderClient>,
        teardown: TeardownPolicy,
    ) -> Self {
        Self {
            catalog,
            blobs,
            builder,
            teardown,
        }
    }

    // ===== Workspaces =====

    pub async fn create_workspace(&self, request: CreateWorkspaceRequest) -> ApiResult<Workspace> {
        let name = validate_name(&request.name)?;
        let workspace = Workspace::new(ids::workspace_id(), name, request.description);
        self.catalog.put_workspace(&workspace).await?;

        info!("Created workspace {} ({})", workspace.id, workspace.name);
        Ok(workspace)
    }

    pub async fn get_workspace(&self, workspace_id: &str) -> ApiResult<Workspace> {
        self.catalog
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Workspace {} not found", workspace_id)))
    }

    pub async fn list_workspaces(&self) -> ApiResult<Vec<Workspace>> {
        Ok(self.catalog.list_workspaces().await?)
    }

    pub async fn update_workspace(
        &self,
        workspace_id: &str,
        request: UpdateWorkspaceRequest,
    ) -> ApiResult<Workspace> {
        let mut updates = Vec::new();
        if let Some(name) = request.name {
            updates.push(FieldUpdate::set("name", validate_name(&name)?));
        }
        if let Some(description) = request.description {
            updates.push(FieldUpdate::set("description", description));
        }

        self.catalog
            .update_workspace(workspace_id, &updates)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Workspace {} not found", workspace_id)))
    }

    /// Delete a workspace with its functions, their logs and sources, and its build tasks
    pub async fn delete_workspace(&self, workspace_id: &str) -> ApiResult<()> {
        self.get_workspace(workspace_id).await?;

        let functions = self.catalog.list_functions(workspace_id).await?;
        for function in &functions {
            self.remove_function(function).await?;
        }

        let tasks = self.catalog.list_tasks(workspace_id).await?;
        for task in &tasks {
            self.catalog.delete_task(workspace_id, &task.task_id).await?;
        }

        match self.blobs.delete_prefix(&build_source_prefix(workspace_id)).await {
            Ok(removed) => debug!("Removed {} build sources of {}", removed, workspace_id),
            Err(e) => warn!("Failed to remove build sources of {}: {}", workspace_id, e),
        }

        self.catalog.delete_workspace(workspace_id).await?;

        info!(
            "Deleted workspace {} ({} functions, {} tasks)",
            workspace_id,
            functions.len(),
            tasks.len()
        );
        Ok(())
    }

    // ===== Functions =====

    pub async fn create_function(
        &self,
        workspace_id: &str,
        request: CreateFunctionRequest,
    ) -> ApiResult<Function> {
        self.get_workspace(workspace_id).await?;

        let name = validate_name(&request.name)?;
        validate_memory(request.memory)?;
        validate_timeout(request.timeout)?;
        let http_methods = validate_methods(&request.http_methods)?;
        let source = decode_code(&request.code)?;

        let function = Function {
            id: ids::function_id(),
            workspace_id: workspace_id.to_string(),
            name,
            description: request.description.unwrap_or_default(),
            runtime: request.runtime,
            memory: request.memory,
            timeout: request.timeout,
            http_methods,
            environment_variables: request.environment_variables,
            code: request.code,
            invocation_url: None,
            status: FunctionStatus::Active,
            last_modified: Utc::now(),
            last_deployed: None,
            invocations_24h: 0,
            errors_24h: 0,
            avg_duration: Decimal::ZERO,
        };

        self.blobs
            .put(&function_source_key(workspace_id, &function.id), source)
            .await?;
        self.catalog.put_function(&function).await?;
        self.catalog.adjust_function_count(workspace_id, 1).await?;

        info!("Created function {} in {}", function.id, workspace_id);
        Ok(function)
    }

    pub async fn get_function(&self, workspace_id: &str, function_id: &str) -> ApiResult<Function> {
        self.catalog
            .get_function(workspace_id, function_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Function {} not found", function_id)))
    }

    pub async fn list_functions(&self, workspace_id: &str) -> ApiResult<Vec<Function>> {
        self.get_workspace(workspace_id).await?;
        Ok(self.catalog.list_functions(workspace_id).await?)
    }

    pub async fn update_function(
        &self,
        workspace_id: &str,
        function_id: &str,
        request: UpdateFunctionRequest,
    ) -> ApiResult<Function> {
        self.get_function(workspace_id, function_id).await?;

        let mut updates = Vec::new();
        if let Some(name) = request.name {
            updates.push(FieldUpdate::set("name", validate_name(&name)?));
        }
        if let Some(description) = request.description {
            updates.push(FieldUpdate::set("description", description));
        }
        if let Some(runtime) = request.runtime {
            updates.push(FieldUpdate::set("runtime", runtime));
        }
        if let Some(memory) = request.memory {
            validate_memory(memory)?;
            updates.push(FieldUpdate::set("memory", memory));
        }
        if let Some(timeout) = request.timeout {
            validate_timeout(timeout)?;
            updates.push(FieldUpdate::set("timeout", timeout));
        }
        if let Some(methods) = request.http_methods {
            updates.push(FieldUpdate::set("httpMethods", encode(&validate_methods(&methods)?)?));
        }
        if let Some(env) = request.environment_variables {
            updates.push(FieldUpdate::set("environmentVariables", encode(&env)?));
        }
        if let Some(url) = request.invocation_url {
            let url = url.trim();
            let value = if url.is_empty() { Value::Null } else { Value::from(url) };
            updates.push(FieldUpdate::set("invocationUrl", value));
        }
        if let Some(status) = request.status {
            let status = FunctionStatus::from_str(&status)
                .map_err(|message| ApiError::invalid_field("status", message))?;
            updates.push(FieldUpdate::set("status", status.as_str()));
        }
        let source = match &request.code {
            Some(code) => Some(decode_code(code)?),
            None => None,
        };

        // All fields validated; only now touch storage
        if let (Some(code), Some(source)) = (request.code, source) {
            self.blobs
                .put(&function_source_key(workspace_id, function_id), source)
                .await?;
            updates.push(FieldUpdate::set("code", code));
        }

        self.catalog
            .update_function(workspace_id, function_id, updates)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Function {} not found", function_id)))
    }

    pub async fn delete_function(&self, workspace_id: &str, function_id: &str) -> ApiResult<()> {
        let function = self.get_function(workspace_id, function_id).await?;
        self.remove_function(&function).await?;

        self.catalog.adjust_function_count(workspace_id, -1).await?;
        if let Err(e) = self.catalog.refresh_workspace_aggregates(workspace_id).await {
            warn!("Failed to refresh aggregates of workspace {}: {}", workspace_id, e);
        }
        Ok(())
    }

    /// Logs, then source blob, then the record; optionally the deployment
    async fn remove_function(&self, function: &Function) -> ApiResult<()> {
        let removed_logs = self.catalog.delete_logs(&function.id).await?;

        let key = function_source_key(&function.workspace_id, &function.id);
        match self.blobs.delete(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Source {} already absent", key),
            Err(e) => warn!("Failed to delete source {}: {}", key, e),
        }

        self.catalog
            .delete_function(&function.workspace_id, &function.id)
            .await?;

        if self.teardown.enabled {
            self.teardown_deployment(function).await;
        }

        info!(
            "Deleted function {} and {} execution logs",
            function.id, removed_logs
        );
        Ok(())
    }

    async fn teardown_deployment(&self, function: &Function) {
        let app_name = slugify(&function.name);
        if app_name.is_empty() {
            return;
        }

        match self
            .builder
            .undeploy(&app_name, &self.teardown.namespace)
            .await
        {
            Ok(true) => info!("Removed deployment {} of {}", app_name, function.id),
            Ok(false) => debug!("No deployment {} to remove", app_name),
            Err(e) => warn!("Failed to remove deployment {}: {:#}", app_name, e),
        }
    }

    // ===== Execution logs =====

    pub async fn list_logs(
        &self,
        workspace_id: &str,
        function_id: &str,
        limit: Option<usize>,
    ) -> ApiResult<Vec<ExecutionLog>> {
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT);
        if !(1..=MAX_LOG_LIMIT).contains(&limit) {
            return Err(ApiError::invalid_field(
                "limit",
                format!("Limit must be between 1 and {}", MAX_LOG_LIMIT),
            ));
        }

        self.get_function(workspace_id, function_id).await?;
        Ok(self.catalog.list_logs(function_id, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_methods() {
        assert!(validate_methods(&[]).is_err());
        assert!(validate_methods(&[" ".to_string()]).is_err());
        assert_eq!(
            validate_methods(&["GET".to_string(), "POST".to_string()]).unwrap(),
            vec!["GET", "POST"]
        );
    }

    #[test]
    fn test_decode_code() {
        assert_eq!(decode_code("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_code("not base64!").unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_limits() {
        assert!(validate_memory(128).is_ok());
        assert!(validate_memory(2048).is_err());
        assert!(validate_timeout(900).is_ok());
        assert!(validate_timeout(0).is_err());
    }
}
