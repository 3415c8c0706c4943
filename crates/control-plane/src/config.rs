//! Configuration management for the control plane
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where workspace, function, log and task records live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    Redis,
    Memory,
}

impl FromStr for MetadataBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(MetadataBackend::Redis),
            "memory" => Ok(MetadataBackend::Memory),
            other => anyhow::bail!("Unknown METADATA_BACKEND '{}': expected redis or memory", other),
        }
    }
}

/// Where function and build sources live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBackend {
    Fs,
    Memory,
}

impl FromStr for BlobBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fs" => Ok(BlobBackend::Fs),
            "memory" => Ok(BlobBackend::Memory),
            other => anyhow::bail!("Unknown BLOB_BACKEND '{}': expected fs or memory", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    pub metadata_backend: MetadataBackend,
    pub redis_url: String,

    /// Namespace for every Redis key the store writes
    pub redis_key_prefix: String,

    pub blob_backend: BlobBackend,
    pub blob_root: PathBuf,

    /// Builder Service base URL
    pub builder_service_url: String,

    pub prometheus_url: String,
    pub loki_url: String,

    /// Allowed CORS origins; `*` allows any
    pub cors_origins: Vec<String>,

    /// Domain appended to a function's slug when it has no recorded address
    pub fallback_service_suffix: String,

    /// Workspace used by build submissions that name none
    pub default_workspace_id: String,

    pub task_poll_interval: Duration,
    pub task_max_poll_attempts: u32,

    /// Wait before re-posting a deploy that returned no endpoint
    pub deploy_readiness_delay: Duration,

    /// Namespace used when tearing down a deleted function's deployment
    pub deploy_namespace: String,

    /// Ask the builder to remove a function's deployment when it is deleted
    pub teardown_on_delete: bool,

    pub environment: String,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(name, default)
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            api_host: var_or("API_HOST", "0.0.0.0"),
            api_port: parse_var("API_PORT", "8000")?,

            metadata_backend: var_or("METADATA_BACKEND", "redis").parse()?,
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            redis_key_prefix: var_or("REDIS_KEY_PREFIX", "faas"),

            blob_backend: var_or("BLOB_BACKEND", "fs").parse()?,
            blob_root: var_or("BLOB_ROOT", "./data/blobs").into(),

            builder_service_url: var_or("BUILDER_SERVICE_URL", "http://127.0.0.1:8085"),
            prometheus_url: var_or("PROMETHEUS_URL", "http://127.0.0.1:9090"),
            loki_url: var_or("LOKI_URL", "http://127.0.0.1:3100"),

            cors_origins: var_or("CORS_ORIGINS", "http://localhost:3000,http://localhost:5173")
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),

            fallback_service_suffix: var_or(
                "FALLBACK_SERVICE_SUFFIX",
                "default.svc.cluster.local",
            ),
            default_workspace_id: var_or(
                "DEFAULT_WORKSPACE_ID",
                faas_common::DEFAULT_WORKSPACE_ID,
            ),

            task_poll_interval: Duration::from_secs(parse_var("TASK_POLL_INTERVAL_SECS", "5")?),
            task_max_poll_attempts: parse_var("TASK_MAX_POLL_ATTEMPTS", "120")?,
            deploy_readiness_delay: Duration::from_secs(parse_var(
                "DEPLOY_READINESS_DELAY_SECS",
                "5",
            )?),
            deploy_namespace: var_or("DEPLOY_NAMESPACE", "default"),
            teardown_on_delete: parse_var("TEARDOWN_ON_DELETE", "false")?,

            environment: var_or("ENVIRONMENT", "development"),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.task_poll_interval.is_zero() {
            anyhow::bail!("TASK_POLL_INTERVAL_SECS must be greater than 0");
        }

        if self.task_max_poll_attempts == 0 {
            anyhow::bail!("TASK_MAX_POLL_ATTEMPTS must be greater than 0");
        }

        for (name, url) in [
            ("BUILDER_SERVICE_URL", &self.builder_service_url),
            ("PROMETHEUS_URL", &self.prometheus_url),
            ("LOKI_URL", &self.loki_url),
        ] {
            if url.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        if self.metadata_backend == MetadataBackend::Redis && self.redis_url.trim().is_empty() {
            anyhow::bail!("REDIS_URL must not be empty when METADATA_BACKEND=redis");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Whether any origin may call the API
    pub fn cors_permissive(&self) -> bool {
        self.cors_origins.iter().any(|origin| origin == "*")
    }

    /// Configuration for tests and local runs: in-memory backends, fast polling
    pub fn for_testing() -> Self {
        Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            metadata_backend: MetadataBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_key_prefix: "faas".to_string(),
            blob_backend: BlobBackend::Memory,
            blob_root: PathBuf::from("./data/blobs"),
            builder_service_url: "http://127.0.0.1:8085".to_string(),
            prometheus_url: "http://127.0.0.1:9090".to_string(),
            loki_url: "http://127.0.0.1:3100".to_string(),
            cors_origins: vec!["*".to_string()],
            fallback_service_suffix: "default.svc.cluster.local".to_string(),
            default_workspace_id: faas_common::DEFAULT_WORKSPACE_ID.to_string(),
            task_poll_interval: Duration::from_millis(10),
            task_max_poll_attempts: 20,
            deploy_readiness_delay: Duration::from_millis(10),
            deploy_namespace: "default".to_string(),
            teardown_on_delete: false,
            environment: "test".to_string(),
        }
    }
}
