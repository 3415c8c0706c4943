//! Read-only proxies to the metrics (Prometheus) and log (Loki) backends

use crate::error::{ApiError, ApiResult};
use crate::models::{LokiLogEntry, LokiLogsResponse, MetricsData, MetricsResponse, TimeseriesPoint};
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// CPU usage window of the metrics range query
pub const METRICS_WINDOW_SECS: u64 = 60 * 60;
const METRICS_STEP: &str = "60s";

pub const DEFAULT_LOKI_LIMIT: u32 = 100;
pub const MAX_LOKI_LIMIT: u32 = 5000;
pub const DEFAULT_LOKI_MINUTES: u32 = 60;
pub const MAX_LOKI_MINUTES: u32 = 7 * 24 * 60;

/// Quote-safe body of a PromQL/LogQL double-quoted label value
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// CPU usage of a function's pods, joined on the pod's function label
pub fn cpu_usage_query(function_id: &str) -> String {
    format!(
        concat!(
            r#"sum(rate(container_cpu_usage_seconds_total{{container!=""}}[1m]) "#,
            r#"* on(namespace, pod) "#,
            r#"group_left(label_function_id) kube_pod_labels{{label_function_id="{}"}})"#
        ),
        escape_label_value(function_id)
    )
}

/// Loki stream selector of a function's logs
pub fn loki_selector(function_id: &str) -> String {
    format!(r#"{{function_id="{}"}}"#, escape_label_value(function_id))
}

/// Prometheus encodes sample values as strings
fn sample_value(raw: &Value) -> Option<f64> {
    match raw {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn instant_total(body: &Value) -> Option<f64> {
    body.pointer("/data/result/0/value/1").and_then(sample_value)
}

fn range_points(body: &Value) -> Vec<TimeseriesPoint> {
    let Some(results) = body.pointer("/data/result").and_then(Value::as_array) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|series| series.get("values").and_then(Value::as_array))
        .flatten()
        .filter_map(|pair| {
            Some(TimeseriesPoint {
                timestamp: sample_value(pair.get(0)?)?,
                value: sample_value(pair.get(1)?)?,
            })
        })
        .collect()
}

/// Newest-first log entries across every returned stream
fn loki_entries(body: &Value, limit: usize) -> Vec<LokiLogEntry> {
    let mut entries: Vec<LokiLogEntry> = body
        .pointer("/data/result")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|stream| stream.get("values").and_then(Value::as_array))
        .flatten()
        .filter_map(|pair| {
            Some(LokiLogEntry {
                timestamp: pair.get(0)?.as_str()?.to_string(),
                line: pair.get(1)?.as_str()?.to_string(),
            })
        })
        .collect();

    // Nanosecond timestamps: longer means later, then lexicographic
    entries.sort_by(|a, b| {
        b.timestamp
            .len()
            .cmp(&a.timestamp.len())
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
    entries.truncate(limit);
    entries
}

pub struct TelemetryClient {
    prometheus_url: String,
    loki_url: String,
    client: reqwest::Client,
}

impl TelemetryClient {
    pub fn new(prometheus_url: &str, loki_url: &str) -> Self {
        Self {
            prometheus_url: prometheus_url.trim_end_matches('/').to_string(),
            loki_url: loki_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        unavailable_code: &'static str,
        backend: &str,
    ) -> ApiResult<Value> {
        let response = self
            .client
            .get(url)
            .query(params)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                ApiError::downstream(unavailable_code, format!("{} unreachable: {}", backend, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::downstream(
                unavailable_code,
                format!("{} returned {}", backend, status),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Internal(format!("Invalid {} response: {}", backend, e)))
    }

    /// Current CPU usage plus the last hour as a series
    pub async fn function_metrics(&self, function_id: &str) -> ApiResult<MetricsResponse> {
        let query = cpu_usage_query(function_id);
        let end = Utc::now().timestamp();
        let start = end - METRICS_WINDOW_SECS as i64;

        debug!("Querying CPU metrics of {}", function_id);

        let instant = self
            .get_json(
                &format!("{}/api/v1/query", self.prometheus_url),
                &[("query", query.clone())],
                "PROMETHEUS_CONNECTION_ERROR",
                "Prometheus",
            )
            .await?;

        let range = self
            .get_json(
                &format!("{}/api/v1/query_range", self.prometheus_url),
                &[
                    ("query", query.clone()),
                    ("start", start.to_string()),
                    ("end", end.to_string()),
                    ("step", METRICS_STEP.to_string()),
                ],
                "PROMETHEUS_CONNECTION_ERROR",
                "Prometheus",
            )
            .await?;

        let both_ok = [&instant, &range]
            .iter()
            .all(|body| body.get("status").and_then(Value::as_str) == Some("success"));

        Ok(MetricsResponse {
            status: if both_ok { "success" } else { "partial" }.to_string(),
            data: MetricsData {
                cpu_total: instant_total(&instant),
                cpu_series: range_points(&range),
                window_seconds: METRICS_WINDOW_SECS,
                instant_query: query.clone(),
                range_query: query,
                raw_instant: instant,
                raw_range: range,
            },
            function_id: function_id.to_string(),
        })
    }

    /// Most recent backend log lines of a function
    pub async fn function_logs(
        &self,
        function_id: &str,
        limit: Option<u32>,
        minutes: Option<u32>,
    ) -> ApiResult<LokiLogsResponse> {
        let limit = limit.unwrap_or(DEFAULT_LOKI_LIMIT);
        if !(1..=MAX_LOKI_LIMIT).contains(&limit) {
            return Err(ApiError::invalid_field(
                "limit",
                format!("Limit must be between 1 and {}", MAX_LOKI_LIMIT),
            ));
        }
        let minutes = minutes.unwrap_or(DEFAULT_LOKI_MINUTES);
        if !(1..=MAX_LOKI_MINUTES).contains(&minutes) {
            return Err(ApiError::invalid_field(
                "minutes",
                format!("Minutes must be between 1 and {}", MAX_LOKI_MINUTES),
            ));
        }

        let end_ns = i128::from(Utc::now().timestamp_micros()) * 1_000;
        let start_ns = end_ns - i128::from(minutes) * 60 * 1_000_000_000;

        let body = self
            .get_json(
                &format!("{}/loki/api/v1/query_range", self.loki_url),
                &[
                    ("query", loki_selector(function_id)),
                    ("limit", limit.to_string()),
                    ("start", start_ns.to_string()),
                    ("end", end_ns.to_string()),
                    ("direction", "backward".to_string()),
                ],
                "LOKI_CONNECTION_ERROR",
                "Loki",
            )
            .await?;

        let logs = loki_entries(&body, limit as usize);
        Ok(LokiLogsResponse {
            total: logs.len(),
            logs,
            function_id: function_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queries() {
        assert_eq!(
            cpu_usage_query("fn-1"),
            r#"sum(rate(container_cpu_usage_seconds_total{container!=""}[1m]) * on(namespace, pod) group_left(label_function_id) kube_pod_labels{label_function_id="fn-1"})"#
        );
        assert_eq!(loki_selector("fn-1"), r#"{function_id="fn-1"}"#);
    }

    #[test]
    fn test_label_values_cannot_break_out_of_quotes() {
        let query = cpu_usage_query(r#"x"} or vector(1) or kube_pod_labels{label_function_id="y"#);
        assert!(query.ends_with(
            r#"kube_pod_labels{label_function_id="x\"} or vector(1) or kube_pod_labels{label_function_id=\"y"})"#
        ));
        assert!(!query.contains(r#"="x"}"#));

        assert_eq!(
            loki_selector(r#"a", namespace=~".+"#),
            r#"{function_id="a\", namespace=~\".+"}"#
        );
        assert_eq!(loki_selector(r"a\b"), r#"{function_id="a\\b"}"#);
    }

    #[test]
    fn test_parse_prometheus_bodies() {
        let instant = json!({
            "status": "success",
            "data": { "result": [ { "metric": {}, "value": [1700000000.0, "0.25"] } ] }
        });
        assert_eq!(instant_total(&instant), Some(0.25));
        assert_eq!(instant_total(&json!({ "data": { "result": [] } })), None);

        let range = json!({
            "status": "success",
            "data": { "result": [ { "values": [[1700000000, "0.1"], [1700000060, "bad"], [1700000120, "0.3"]] } ] }
        });
        let points = range_points(&range);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].value, 0.3);
    }

    #[test]
    fn test_loki_entries_newest_first() {
        let body = json!({
            "data": { "result": [
                { "stream": {}, "values": [["1700000000000000002", "b"], ["1700000000000000001", "a"]] },
                { "stream": {}, "values": [["1700000000000000003", "c"]] }
            ] }
        });

        let entries = loki_entries(&body, 2);
        let lines: Vec<_> = entries.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["c", "b"]);
    }
}
