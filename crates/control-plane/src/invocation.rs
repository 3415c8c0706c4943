//! Function invocation: address resolution, timeout-bounded call, logging and metrics

use crate::catalog::Catalog;
use crate::error::{ApiError, ApiResult};
use crate::models::InvocationResult;
use chrono::Utc;
use faas_common::{ids, ExecutionLog, ExecutionStatus, Function, LogLevel};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest DNS label
const MAX_SLUG_LEN: usize = 63;

/// DNS-label-safe form of a function name: lowercase alphanumerics joined by
/// single hyphens, no leading or trailing hyphen
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    slug.trim_end_matches('-').to_string()
}

/// Prefix `http://` when the address carries no scheme
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Where an invocation is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// The function's recorded invocation URL
    Configured(String),
    /// Derived from the function's name and the service-discovery suffix
    Fallback(String),
}

impl Address {
    pub fn url(&self) -> &str {
        match self {
            Address::Configured(url) | Address::Fallback(url) => url,
        }
    }
}

/// Resolve the address of a function, or `None` when it is not deployed
pub fn resolve_address(function: &Function, fallback_suffix: &str) -> Option<Address> {
    if let Some(url) = function
        .invocation_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
    {
        return Some(Address::Configured(normalize_url(url)));
    }

    let slug = slugify(&function.name);
    if slug.is_empty() {
        return None;
    }
    Some(Address::Fallback(format!("http://{}.{}", slug, fallback_suffix)))
}

/// Best-effort JSON: parsed when possible, raw text otherwise
fn decode_body(text: String) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Elapsed wall-clock time in milliseconds, exact to the microsecond
fn elapsed_ms(started: Instant) -> Decimal {
    let micros = i64::try_from(started.elapsed().as_micros()).unwrap_or(i64::MAX);
    Decimal::new(micros, 3)
}

enum Outcome {
    Response { status: u16, body: Option<Value> },
    TimedOut,
    Unreachable(String),
}

pub struct InvocationEngine {
    catalog: Catalog,
    client: reqwest::Client,
    fallback_suffix: String,
}

impl InvocationEngine {
    pub fn new(catalog: Catalog, fallback_suffix: &str, client: reqwest::Client) -> Self {
        Self {
            catalog,
            client,
            fallback_suffix: fallback_suffix.to_string(),
        }
    }

    /// Call a function and fold the outcome into its log and metrics.
    ///
    /// Exactly one execution log is written per attempted call. A function
    /// with no reachable address fails before any call and writes nothing.
    pub async fn invoke(
        &self,
        workspace_id: &str,
        function_id: &str,
        body: &[u8],
    ) -> ApiResult<InvocationResult> {
        let function = self
            .catalog
            .get_function(workspace_id, function_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Function {} not found", function_id)))?;

        let address = resolve_address(&function, &self.fallback_suffix).ok_or_else(|| {
            ApiError::NotDeployed(format!(
                "Function {} is not deployed: no invocation URL and no service name to derive one from",
                function.id
            ))
        })?;

        let request_body: Value = serde_json::from_slice(body).unwrap_or_else(|_| json!({}));
        let timeout_secs = u64::from(function.timeout.max(1));

        debug!("Invoking {} at {}", function.id, address.url());

        let started = Instant::now();
        let outcome = self
            .call(address.url(), &request_body, Duration::from_secs(timeout_secs))
            .await;
        let duration = elapsed_ms(started);

        let (status, status_code, level, line, response_body) = match &outcome {
            Outcome::Response { status, body } => {
                let success = (200..300).contains(status);
                (
                    if success { ExecutionStatus::Success } else { ExecutionStatus::Error },
                    *status,
                    if success { LogLevel::Info } else { LogLevel::Warn },
                    format!("POST {} returned {}", address.url(), status),
                    body.clone(),
                )
            }
            Outcome::TimedOut => (
                ExecutionStatus::Error,
                504,
                LogLevel::Error,
                format!("Function timed out after {}s", timeout_secs),
                None,
            ),
            Outcome::Unreachable(reason) => (
                ExecutionStatus::Error,
                503,
                LogLevel::Error,
                format!("Function unreachable at {}: {}", address.url(), reason),
                None,
            ),
        };

        let log = ExecutionLog {
            id: ids::log_id(),
            function_id: function.id.clone(),
            timestamp: Utc::now(),
            status,
            duration,
            status_code,
            request_body: Some(request_body),
            response_body: response_body.clone(),
            logs: vec![line.clone()],
            level,
        };

        info!(
            "Invocation of {} finished: {} in {}ms",
            function.id, status_code, duration
        );

        self.record(&function, &log).await;

        if status == ExecutionStatus::Success {
            if let Address::Fallback(url) = &address {
                self.remember_address(&function, url).await;
            }
        }

        match outcome {
            Outcome::Response { .. } => Ok(InvocationResult {
                log_id: log.id,
                status,
                status_code,
                duration,
                response: response_body,
            }),
            Outcome::TimedOut => Err(ApiError::Timeout(line)),
            Outcome::Unreachable(_) => Err(ApiError::downstream("FUNCTION_UNREACHABLE", line)),
        }
    }

    async fn call(&self, url: &str, body: &Value, limit: Duration) -> Outcome {
        let exchange = async {
            let response = self.client.post(url).json(body).send().await?;
            let status = response.status().as_u16();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        match tokio::time::timeout(limit, exchange).await {
            Ok(Ok((status, text))) => Outcome::Response {
                status,
                body: decode_body(text),
            },
            Ok(Err(e)) => Outcome::Unreachable(e.to_string()),
            Err(_) => Outcome::TimedOut,
        }
    }

    /// Write the log and fold the metrics; failures are logged and swallowed
    async fn record(&self, function: &Function, log: &ExecutionLog) {
        if let Err(e) = self.catalog.put_log(log).await {
            warn!("Failed to write execution log for {}: {}", function.id, e);
        }

        let success = log.status == ExecutionStatus::Success;
        match self
            .catalog
            .record_invocation(&function.workspace_id, &function.id, log.duration, success)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!("Function {} vanished before its metrics were updated", function.id),
            Err(e) => warn!("Failed to update metrics of {}: {}", function.id, e),
        }

        if let Err(e) = self
            .catalog
            .refresh_workspace_aggregates(&function.workspace_id)
            .await
        {
            warn!(
                "Failed to refresh aggregates of workspace {}: {}",
                function.workspace_id, e
            );
        }
    }

    /// Persist a derived address that just worked
    async fn remember_address(&self, function: &Function, url: &str) {
        match self
            .catalog
            .set_invocation_url(&function.workspace_id, &function.id, url)
            .await
        {
            Ok(_) => info!("Recorded derived address {} for {}", url, function.id),
            Err(e) => warn!("Failed to record derived address for {}: {}", function.id, e),
        }
    }
}
