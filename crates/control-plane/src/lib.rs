//! FaaS Control Plane
//!
//! REST API managing workspaces and functions, orchestrating builds, pushes
//! and deploys through an external Builder Service, invoking deployed
//! functions, and proxying their Prometheus metrics and Loki logs.
//!
//! ## Endpoints
//!
//! - `POST/GET /api/workspaces`, `GET/PATCH/DELETE /api/workspaces/{id}`
//! - `POST/GET /api/workspaces/{id}/functions`
//! - `GET/PATCH/DELETE /api/workspaces/{id}/functions/{fid}`
//! - `POST /api/workspaces/{id}/functions/{fid}/invoke`
//! - `GET /api/workspaces/{id}/functions/{fid}/logs`
//! - `POST /api/v1/build`, `POST /api/v1/push`, `POST /api/v1/build-and-push`
//! - `GET /api/v1/tasks/{id}`, `GET /api/v1/workspaces/{id}/tasks`
//! - `POST /api/v1/scaffold`, `POST /api/v1/deploy`
//! - `GET /api/functions/{id}/metrics`, `GET /api/functions/{id}/loki-logs`
//! - `GET /`, `GET /health`

pub mod blob;
pub mod builder_client;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handlers;
pub mod invocation;
pub mod models;
pub mod resources;
pub mod storage;
pub mod tasks;
pub mod telemetry;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::blob::BlobStore;
use crate::builder_client::BuilderClient;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::invocation::InvocationEngine;
use crate::resources::{ResourceService, TeardownPolicy};
use crate::storage::MetadataStore;
use crate::tasks::{TaskEngine, TaskSettings};
use crate::telemetry::TelemetryClient;

pub use config::{BlobBackend, MetadataBackend};
pub use error::{ApiError, ApiResult};

/// Largest accepted request body (source uploads)
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Services shared by every handler
pub struct AppState {
    pub config: Config,
    pub resources: ResourceService,
    pub tasks: TaskEngine,
    pub invocations: InvocationEngine,
    pub telemetry: TelemetryClient,
}

impl AppState {
    /// Wire every service over the given backends
    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::with_function_client(config, metadata, blobs, shutdown, reqwest::Client::new())
    }

    /// Like [`AppState::new`], with the HTTP client used to call functions
    pub fn with_function_client(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        shutdown: CancellationToken,
        function_client: reqwest::Client,
    ) -> Self {
        let catalog = Catalog::new(metadata);
        let builder = Arc::new(BuilderClient::new(&config.builder_service_url));

        let resources = ResourceService::new(
            catalog.clone(),
            blobs.clone(),
            builder.clone(),
            TeardownPolicy {
                enabled: config.teardown_on_delete,
                namespace: config.deploy_namespace.clone(),
            },
        );

        let tasks = TaskEngine::new(
            catalog.clone(),
            blobs,
            builder,
            TaskSettings {
                poll_interval: config.task_poll_interval,
                max_poll_attempts: config.task_max_poll_attempts,
                readiness_delay: config.deploy_readiness_delay,
                default_workspace_id: config.default_workspace_id.clone(),
            },
            shutdown,
        );

        let invocations =
            InvocationEngine::new(catalog, &config.fallback_service_suffix, function_client);
        let telemetry = TelemetryClient::new(&config.prometheus_url, &config.loki_url);

        Self {
            config,
            resources,
            tasks,
            invocations,
            telemetry,
        }
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_permissive() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn api_routes() -> Router<Arc<AppState>> {
    use handlers::{builds, functions, telemetry, workspaces};

    Router::new()
        // Workspaces
        .route(
            "/workspaces",
            post(workspaces::create_workspace_handler).get(workspaces::list_workspaces_handler),
        )
        .route(
            "/workspaces/{workspace_id}",
            get(workspaces::get_workspace_handler)
                .patch(workspaces::update_workspace_handler)
                .delete(workspaces::delete_workspace_handler),
        )
        // Functions
        .route(
            "/workspaces/{workspace_id}/functions",
            post(functions::create_function_handler).get(functions::list_functions_handler),
        )
        .route(
            "/workspaces/{workspace_id}/functions/{function_id}",
            get(functions::get_function_handler)
                .patch(functions::update_function_handler)
                .delete(functions::delete_function_handler),
        )
        .route(
            "/workspaces/{workspace_id}/functions/{function_id}/invoke",
            post(functions::invoke_function_handler),
        )
        .route(
            "/workspaces/{workspace_id}/functions/{function_id}/logs",
            get(functions::function_logs_handler),
        )
        // Builder Service orchestration
        .route("/v1/build", post(builds::build_handler))
        .route("/v1/push", post(builds::push_handler))
        .route("/v1/build-and-push", post(builds::build_and_push_handler))
        .route("/v1/tasks/{task_id}", get(builds::task_status_handler))
        .route(
            "/v1/workspaces/{workspace_id}/tasks",
            get(builds::workspace_tasks_handler),
        )
        .route("/v1/scaffold", post(builds::scaffold_handler))
        .route("/v1/deploy", post(builds::deploy_handler))
        // Telemetry
        .route(
            "/functions/{function_id}/metrics",
            get(telemetry::function_metrics_handler),
        )
        .route(
            "/functions/{function_id}/loki-logs",
            get(telemetry::loki_logs_handler),
        )
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    let state = Arc::new(state);

    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/health", get(handlers::health_handler))
        .nest("/api", api_routes())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
