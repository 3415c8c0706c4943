//! Typed access to control-plane records on top of a [`MetadataStore`]

use crate::storage::{from_item, to_item, FieldUpdate, ItemKey, MetadataStore, SortOrder};
use chrono::{SecondsFormat, Utc};
use faas_common::{next_average, BuildTask, ExecutionLog, Function, Result, Workspace};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const WORKSPACE_SK: &str = "METADATA";
const INDEX_SK: &str = "WORKSPACE";

fn workspace_pk(workspace_id: &str) -> String {
    format!("WS#{}", workspace_id)
}

fn workspace_key(workspace_id: &str) -> ItemKey {
    ItemKey::new(workspace_pk(workspace_id), WORKSPACE_SK)
}

fn function_key(workspace_id: &str, function_id: &str) -> ItemKey {
    ItemKey::new(workspace_pk(workspace_id), format!("FN#{}", function_id))
}

fn function_index_key(function_id: &str) -> ItemKey {
    ItemKey::new(format!("FN#{}", function_id), INDEX_SK)
}

fn task_key(workspace_id: &str, task_id: &str) -> ItemKey {
    ItemKey::new(workspace_pk(workspace_id), format!("TASK#{}", task_id))
}

fn task_index_key(task_id: &str) -> ItemKey {
    ItemKey::new(format!("TASK#{}", task_id), INDEX_SK)
}

fn log_key(log: &ExecutionLog) -> ItemKey {
    ItemKey::new(
        format!("FN#{}", log.function_id),
        format!(
            "LOG#{}#{}",
            log.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            log.id
        ),
    )
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Percentage of failed invocations, rounded to two decimal places
pub fn error_rate(errors: i64, invocations: i64) -> Decimal {
    if invocations <= 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(errors) * Decimal::ONE_HUNDRED / Decimal::from(invocations)).round_dp(2)
}

/// Record-level operations over workspaces, functions, logs and build tasks
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn MetadataStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    // ===== Workspaces =====

    pub async fn put_workspace(&self, workspace: &Workspace) -> Result<()> {
        self.store
            .put(&workspace_key(&workspace.id), to_item(workspace)?)
            .await
    }

    pub async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        match self.store.get(&workspace_key(workspace_id)).await? {
            Some(item) => from_item(item).map(Some),
            None => Ok(None),
        }
    }

    /// Full scan; fine for the small number of workspaces a deployment holds
    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut workspaces = self
            .store
            .scan("WS#", WORKSPACE_SK)
            .await?
            .into_iter()
            .map(from_item)
            .collect::<Result<Vec<Workspace>>>()?;
        workspaces.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workspaces)
    }

    pub async fn update_workspace(
        &self,
        workspace_id: &str,
        updates: &[FieldUpdate],
    ) -> Result<Option<Workspace>> {
        if updates.is_empty() {
            return self.get_workspace(workspace_id).await;
        }
        match self.store.update(&workspace_key(workspace_id), updates).await? {
            Some(item) => from_item(item).map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<bool> {
        self.store.delete(&workspace_key(workspace_id)).await
    }

    /// Atomically shift the workspace's function counter
    pub async fn adjust_function_count(&self, workspace_id: &str, delta: i64) -> Result<()> {
        self.store
            .update(
                &workspace_key(workspace_id),
                &[FieldUpdate::increment("functionCount", delta)],
            )
            .await?;
        Ok(())
    }

    /// Recompute the workspace's invocation and error aggregates from its functions
    pub async fn refresh_workspace_aggregates(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        let functions = self.list_functions(workspace_id).await?;
        let invocations: i64 = functions.iter().map(|f| f.invocations_24h).sum();
        let errors: i64 = functions.iter().map(|f| f.errors_24h).sum();
        let rate = error_rate(errors, invocations);

        debug!(
            "Workspace {} aggregates: {} invocations, {}% errors",
            workspace_id, invocations, rate
        );

        self.update_workspace(
            workspace_id,
            &[
                FieldUpdate::set("invocations24h", invocations),
                FieldUpdate::set("errorRate", rate.to_string()),
            ],
        )
        .await
    }

    // ===== Functions =====

    /// Store a function along with its id index
    pub async fn put_function(&self, function: &Function) -> Result<()> {
        self.store
            .put(
                &function_key(&function.workspace_id, &function.id),
                to_item(function)?,
            )
            .await?;
        self.store
            .put(
                &function_index_key(&function.id),
                to_item(&json!({ "workspaceId": function.workspace_id }))?,
            )
            .await
    }

    pub async fn get_function(
        &self,
        workspace_id: &str,
        function_id: &str,
    ) -> Result<Option<Function>> {
        match self.store.get(&function_key(workspace_id, function_id)).await? {
            Some(item) => from_item(item).map(Some),
            None => Ok(None),
        }
    }

    /// Look a function up by id alone, through the id index
    pub async fn find_function(&self, function_id: &str) -> Result<Option<Function>> {
        let Some(index) = self.store.get(&function_index_key(function_id)).await? else {
            return Ok(None);
        };
        match index.get("workspaceId").and_then(Value::as_str) {
            Some(workspace_id) => self.get_function(workspace_id, function_id).await,
            None => Ok(None),
        }
    }

    pub async fn list_functions(&self, workspace_id: &str) -> Result<Vec<Function>> {
        self.store
            .query(&workspace_pk(workspace_id), "FN#", SortOrder::Ascending, None)
            .await?
            .into_iter()
            .map(from_item)
            .collect()
    }

    /// Patch a function's configuration; stamps `lastModified`
    pub async fn update_function(
        &self,
        workspace_id: &str,
        function_id: &str,
        mut updates: Vec<FieldUpdate>,
    ) -> Result<Option<Function>> {
        updates.push(FieldUpdate::set("lastModified", to_value(&Utc::now())?));
        self.apply_function_updates(workspace_id, function_id, &updates)
            .await
    }

    async fn apply_function_updates(
        &self,
        workspace_id: &str,
        function_id: &str,
        updates: &[FieldUpdate],
    ) -> Result<Option<Function>> {
        match self
            .store
            .update(&function_key(workspace_id, function_id), updates)
            .await?
        {
            Some(item) => from_item(item).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a function record and its id index
    pub async fn delete_function(&self, workspace_id: &str, function_id: &str) -> Result<bool> {
        let removed = self
            .store
            .delete(&function_key(workspace_id, function_id))
            .await?;
        self.store.delete(&function_index_key(function_id)).await?;
        Ok(removed)
    }

    /// Fold one invocation into the function's rolling counters.
    ///
    /// Counters are incremented atomically; the mean is recomputed from the
    /// freshest record, so concurrent invocations can still lose a sample.
    pub async fn record_invocation(
        &self,
        workspace_id: &str,
        function_id: &str,
        duration: Decimal,
        success: bool,
    ) -> Result<Option<Function>> {
        let Some(current) = self.get_function(workspace_id, function_id).await? else {
            return Ok(None);
        };

        let avg = next_average(current.avg_duration, current.invocations_24h, duration);
        let mut updates = vec![
            FieldUpdate::increment("invocations24h", 1),
            FieldUpdate::set("avgDuration", avg.to_string()),
        ];
        if !success {
            updates.push(FieldUpdate::increment("errors24h", 1));
        }

        self.apply_function_updates(workspace_id, function_id, &updates)
            .await
    }

    /// Record where a deployed function can be reached
    pub async fn set_invocation_url(
        &self,
        workspace_id: &str,
        function_id: &str,
        url: &str,
    ) -> Result<Option<Function>> {
        self.apply_function_updates(
            workspace_id,
            function_id,
            &[FieldUpdate::set("invocationUrl", url)],
        )
        .await
    }

    // ===== Execution logs =====

    pub async fn put_log(&self, log: &ExecutionLog) -> Result<()> {
        self.store.put(&log_key(log), to_item(log)?).await
    }

    /// Most recent logs first
    pub async fn list_logs(&self, function_id: &str, limit: usize) -> Result<Vec<ExecutionLog>> {
        self.store
            .query(
                &format!("FN#{}", function_id),
                "LOG#",
                SortOrder::Descending,
                Some(limit),
            )
            .await?
            .into_iter()
            .map(from_item)
            .collect()
    }

    /// Delete every log of a function, returning how many were removed
    pub async fn delete_logs(&self, function_id: &str) -> Result<usize> {
        let logs: Vec<ExecutionLog> = self
            .store
            .query(&format!("FN#{}", function_id), "LOG#", SortOrder::Ascending, None)
            .await?
            .into_iter()
            .map(from_item)
            .collect::<Result<_>>()?;

        let mut removed = 0;
        for log in &logs {
            if self.store.delete(&log_key(log)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ===== Build tasks =====

    /// Store a new task along with its id index
    pub async fn create_task(&self, task: &BuildTask) -> Result<()> {
        self.store
            .put(&task_key(&task.workspace_id, &task.task_id), to_item(task)?)
            .await?;
        self.store
            .put(
                &task_index_key(&task.task_id),
                to_item(&json!({ "workspaceId": task.workspace_id }))?,
            )
            .await
    }

    /// Overwrite a stored task with this state. Returns false, writing
    /// nothing, when the task was deleted in the meantime.
    pub async fn update_task(&self, task: &BuildTask) -> Result<bool> {
        let updates: Vec<FieldUpdate> = to_item(task)?
            .into_iter()
            .map(|(field, value)| FieldUpdate::Set(field, value))
            .collect();
        Ok(self
            .store
            .update(&task_key(&task.workspace_id, &task.task_id), &updates)
            .await?
            .is_some())
    }

    pub async fn get_task(&self, workspace_id: &str, task_id: &str) -> Result<Option<BuildTask>> {
        match self.store.get(&task_key(workspace_id, task_id)).await? {
            Some(item) => from_item(item).map(Some),
            None => Ok(None),
        }
    }

    /// Look a task up by id alone, through the id index
    pub async fn find_task(&self, task_id: &str) -> Result<Option<BuildTask>> {
        let Some(index) = self.store.get(&task_index_key(task_id)).await? else {
            return Ok(None);
        };
        match index.get("workspaceId").and_then(Value::as_str) {
            Some(workspace_id) => self.get_task(workspace_id, task_id).await,
            None => Ok(None),
        }
    }

    /// Tasks of a workspace, most recent first
    pub async fn list_tasks(&self, workspace_id: &str) -> Result<Vec<BuildTask>> {
        let mut tasks = self
            .store
            .query(&workspace_pk(workspace_id), "TASK#", SortOrder::Ascending, None)
            .await?
            .into_iter()
            .map(from_item)
            .collect::<Result<Vec<BuildTask>>>()?;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    pub async fn delete_task(&self, workspace_id: &str, task_id: &str) -> Result<bool> {
        let removed = self.store.delete(&task_key(workspace_id, task_id)).await?;
        self.store.delete(&task_index_key(task_id)).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryMetadataStore;
    use faas_common::{ExecutionStatus, FunctionStatus, LogLevel, TaskKind};
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn catalog() -> Catalog {
        Catalog::new(Arc::new(InMemoryMetadataStore::new()))
    }

    fn function(workspace_id: &str, id: &str) -> Function {
        Function {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            name: "hello".to_string(),
            description: String::new(),
            runtime: "Python 3.12".to_string(),
            memory: 256,
            timeout: 30,
            http_methods: vec!["GET".to_string()],
            environment_variables: BTreeMap::new(),
            code: "aGVsbG8=".to_string(),
            invocation_url: None,
            status: FunctionStatus::Active,
            last_modified: Utc::now(),
            last_deployed: None,
            invocations_24h: 0,
            errors_24h: 0,
            avg_duration: Decimal::ZERO,
        }
    }

    #[test]
    fn test_error_rate() {
        assert_eq!(error_rate(0, 0), Decimal::ZERO);
        assert_eq!(error_rate(1, 3), Decimal::from_str("33.33").unwrap());
        assert_eq!(error_rate(2, 2), Decimal::ONE_HUNDRED);
    }

    #[tokio::test]
    async fn test_function_counter_and_index() {
        let catalog = catalog();
        let workspace = Workspace::new("ws-1".to_string(), "demo".to_string(), None);
        catalog.put_workspace(&workspace).await.unwrap();

        catalog.put_function(&function("ws-1", "fn-1")).await.unwrap();
        catalog.adjust_function_count("ws-1", 1).await.unwrap();

        let stored = catalog.get_workspace("ws-1").await.unwrap().unwrap();
        assert_eq!(stored.function_count, 1);

        let found = catalog.find_function("fn-1").await.unwrap().unwrap();
        assert_eq!(found.workspace_id, "ws-1");

        assert!(catalog.delete_function("ws-1", "fn-1").await.unwrap());
        assert!(catalog.find_function("fn-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_invocation_folds_metrics() {
        let catalog = catalog();
        catalog.put_function(&function("ws-1", "fn-1")).await.unwrap();

        let samples = [("10", true), ("30", false), ("20", true)];
        for (duration, success) in samples {
            catalog
                .record_invocation("ws-1", "fn-1", Decimal::from_str(duration).unwrap(), success)
                .await
                .unwrap();
        }

        let stored = catalog.get_function("ws-1", "fn-1").await.unwrap().unwrap();
        assert_eq!(stored.invocations_24h, 3);
        assert_eq!(stored.errors_24h, 1);
        assert_eq!(stored.avg_duration, Decimal::from(20));
    }

    #[tokio::test]
    async fn test_logs_listed_newest_first() {
        let catalog = catalog();
        let base = Utc::now();

        for offset in 0..3 {
            let log = ExecutionLog {
                id: format!("log-{}", offset),
                function_id: "fn-1".to_string(),
                timestamp: base + chrono::Duration::milliseconds(offset),
                status: ExecutionStatus::Success,
                duration: Decimal::ONE,
                status_code: 200,
                request_body: None,
                response_body: None,
                logs: vec![],
                level: LogLevel::Info,
            };
            catalog.put_log(&log).await.unwrap();
        }

        let logs = catalog.list_logs("fn-1", 2).await.unwrap();
        let ids: Vec<_> = logs.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["log-2", "log-1"]);

        assert_eq!(catalog.delete_logs("fn-1").await.unwrap(), 3);
        assert!(catalog.list_logs("fn-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_task_through_index() {
        let catalog = catalog();
        let task = BuildTask::new(
            "task-1".to_string(),
            "ws-1".to_string(),
            "app-1".to_string(),
            TaskKind::Build,
        );
        catalog.create_task(&task).await.unwrap();

        let found = catalog.find_task("task-1").await.unwrap().unwrap();
        assert_eq!(found, task);
        assert!(catalog.find_task("task-2").await.unwrap().is_none());

        assert!(catalog.delete_task("ws-1", "task-1").await.unwrap());
        assert!(catalog.find_task("task-1").await.unwrap().is_none());
    }
}
