//! FaaS Control Plane
//!
//! REST API server plus the supervised background task sequences

use anyhow::{Context, Result};
use control_plane::{
    blob::{BlobStore, FsBlobStore, InMemoryBlobStore},
    config::Config,
    create_router,
    storage::{InMemoryMetadataStore, MetadataStore, RedisMetadataStore},
    AppState, BlobBackend, MetadataBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight task sequences get to stop after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "faas_control_plane=debug,control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting FaaS Control Plane ({})", config.environment);
    info!("Builder Service URL: {}", config.builder_service_url);

    let metadata: Arc<dyn MetadataStore> = match config.metadata_backend {
        MetadataBackend::Redis => {
            info!("Metadata store: Redis at {}", config.redis_url);
            let store = RedisMetadataStore::new(&config.redis_url, &config.redis_key_prefix)
                .await
                .context("Failed to initialize Redis metadata store")?;
            Arc::new(store)
        }
        MetadataBackend::Memory => {
            warn!("Metadata store: in-memory, records are lost on restart");
            Arc::new(InMemoryMetadataStore::new())
        }
    };

    let blobs: Arc<dyn BlobStore> = match config.blob_backend {
        BlobBackend::Fs => {
            info!("Blob store: {}", config.blob_root.display());
            std::fs::create_dir_all(&config.blob_root)
                .context("Failed to create blob directory")?;
            Arc::new(FsBlobStore::new(config.blob_root.clone()))
        }
        BlobBackend::Memory => {
            warn!("Blob store: in-memory, sources are lost on restart");
            Arc::new(InMemoryBlobStore::new())
        }
    };

    let addr = config.api_address();
    let shutdown = CancellationToken::new();
    let state = AppState::new(config, metadata, blobs, shutdown.clone());
    let tasks = state.tasks.clone();

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("FaaS Control Plane running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error")?;

    info!("Waiting for in-flight tasks to stop");
    tasks.shutdown();
    if tokio::time::timeout(DRAIN_TIMEOUT, tasks.wait()).await.is_err() {
        warn!("Background tasks still running after {:?}", DRAIN_TIMEOUT);
    }

    info!("FaaS Control Plane stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM, cancelling `token` so task sequences stop too
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    token.cancel();
}
