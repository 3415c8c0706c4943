//! Integration tests for function invocation, execution logs and metrics

mod common;

use axum::http::StatusCode;
use common::{test_app, test_app_with_function_client, TestApp};
use control_plane::config::Config;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn point_at(app: &TestApp, ws: &str, fid: &str, url: &str) {
    let (status, _) = app
        .patch_json(
            &format!("/api/workspaces/{}/functions/{}", ws, fid),
            &json!({ "invocationUrl": url }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

async fn invoke(app: &TestApp, ws: &str, fid: &str, body: &Value) -> (StatusCode, Value) {
    app.post_json(
        &format!("/api/workspaces/{}/functions/{}/invoke", ws, fid),
        body,
    )
    .await
}

async fn logs(app: &TestApp, ws: &str, fid: &str) -> Value {
    let (status, body) = app
        .get(&format!("/api/workspaces/{}/functions/{}/logs", ws, fid))
        .await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn test_demo_scenario() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "message": "hello" }))
                .set_delay(Duration::from_millis(10)),
        )
        .mount(&endpoint)
        .await;

    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;
    point_at(&app, &ws, &fid, &endpoint.uri()).await;

    let (_, workspace) = app.get(&format!("/api/workspaces/{}", ws)).await;
    assert_eq!(workspace["functionCount"], 1);

    let (status, result) = invoke(&app, &ws, &fid, &json!({ "name": "world" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "success");
    assert_eq!(result["statusCode"], 200);
    assert_eq!(result["response"], json!({ "message": "hello" }));
    assert!(!result["logId"].as_str().unwrap().is_empty());

    let (_, function) = app
        .get(&format!("/api/workspaces/{}/functions/{}", ws, fid))
        .await;
    assert!(function["avgDuration"].as_f64().unwrap() >= 10.0);
    assert_eq!(function["invocations24h"], 1);
    assert_eq!(function["errors24h"], 0);

    let (_, workspace) = app.get(&format!("/api/workspaces/{}", ws)).await;
    assert_eq!(workspace["invocations24h"], 1);
    assert_eq!(workspace["errorRate"], 0.0);

    let logs = logs(&app, &ws, &fid).await;
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["logs"][0]["level"], "info");
    assert_eq!(logs["logs"][0]["requestBody"], json!({ "name": "world" }));
}

#[tokio::test]
async fn test_average_duration_is_cumulative_mean() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&endpoint)
        .await;

    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;
    point_at(&app, &ws, &fid, &endpoint.uri()).await;

    let mut durations = Vec::new();
    for _ in 0..5 {
        let (status, result) = invoke(&app, &ws, &fid, &json!({})).await;
        assert_eq!(status, StatusCode::OK);
        durations.push(result["duration"].as_f64().unwrap());
    }

    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    let (_, function) = app
        .get(&format!("/api/workspaces/{}/functions/{}", ws, fid))
        .await;
    assert_eq!(function["invocations24h"], 5);
    assert!((function["avgDuration"].as_f64().unwrap() - mean).abs() < 0.001);
}

#[tokio::test]
async fn test_error_response_is_relayed_and_counted() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&endpoint)
        .await;

    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;
    point_at(&app, &ws, &fid, &endpoint.uri()).await;

    let (status, result) = invoke(&app, &ws, &fid, &json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "error");
    assert_eq!(result["statusCode"], 500);
    assert_eq!(result["response"], "boom");

    let (_, function) = app
        .get(&format!("/api/workspaces/{}/functions/{}", ws, fid))
        .await;
    assert_eq!(function["errors24h"], 1);

    let logs = logs(&app, &ws, &fid).await;
    assert_eq!(logs["logs"][0]["level"], "warn");
    assert_eq!(logs["logs"][0]["statusCode"], 500);
}

#[tokio::test]
async fn test_workspace_error_rate() {
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&broken)
        .await;

    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let ok_fn = app.create_function(&ws, "ok").await;
    let bad_fn = app.create_function(&ws, "bad").await;
    point_at(&app, &ws, &ok_fn, &healthy.uri()).await;
    point_at(&app, &ws, &bad_fn, &broken.uri()).await;

    invoke(&app, &ws, &ok_fn, &json!({})).await;
    invoke(&app, &ws, &ok_fn, &json!({})).await;
    invoke(&app, &ws, &ok_fn, &json!({})).await;
    invoke(&app, &ws, &bad_fn, &json!({})).await;

    let (_, workspace) = app.get(&format!("/api/workspaces/{}", ws)).await;
    assert_eq!(workspace["invocations24h"], 4);
    assert_eq!(workspace["errorRate"], 25.0);
}

#[tokio::test]
async fn test_unparseable_body_sent_as_empty_object() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_json(json!({})))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .expect(1)
        .mount(&endpoint)
        .await;

    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;
    point_at(&app, &ws, &fid, &endpoint.uri()).await;

    let (status, result) = app
        .request(
            axum::http::Request::builder()
                .uri(format!("/api/workspaces/{}/functions/{}/invoke", ws, fid))
                .method("POST")
                .body(axum::body::Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "success");
    assert!(result["response"].is_null());
}

#[tokio::test]
async fn test_timeout_is_logged_as_error() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&endpoint)
        .await;

    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let (status, created) = app
        .post_json(
            &format!("/api/workspaces/{}/functions", ws),
            &json!({ "name": "slow", "code": "aGk=", "timeout": 1 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let fid = created["id"].as_str().unwrap().to_string();
    point_at(&app, &ws, &fid, &endpoint.uri()).await;

    let (status, body) = invoke(&app, &ws, &fid, &json!({})).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["code"], "TIMEOUT");
    assert_eq!(body["error"]["message"], "Function timed out after 1s");

    let logs = logs(&app, &ws, &fid).await;
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["logs"][0]["status"], "error");
    assert_eq!(logs["logs"][0]["statusCode"], 504);
    assert_eq!(logs["logs"][0]["level"], "error");
}

#[tokio::test]
async fn test_unreachable_endpoint() {
    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;
    point_at(&app, &ws, &fid, "http://127.0.0.1:1").await;

    let (status, body) = invoke(&app, &ws, &fid, &json!({})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "FUNCTION_UNREACHABLE");

    let logs = logs(&app, &ws, &fid).await;
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["logs"][0]["statusCode"], 503);
    assert_eq!(logs["logs"][0]["level"], "error");

    let (_, function) = app
        .get(&format!("/api/workspaces/{}/functions/{}", ws, fid))
        .await;
    assert_eq!(function["invocations24h"], 1);
    assert_eq!(function["errors24h"], 1);
}

#[tokio::test]
async fn test_not_deployed_writes_no_log() {
    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "!!!").await;

    let (status, body) = invoke(&app, &ws, &fid, &json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "NOT_DEPLOYED");

    assert_eq!(logs(&app, &ws, &fid).await["total"], 0);
    let (_, function) = app
        .get(&format!("/api/workspaces/{}/functions/{}", ws, fid))
        .await;
    assert_eq!(function["invocations24h"], 0);
}

#[tokio::test]
async fn test_unknown_function() {
    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;

    let (status, body) = invoke(&app, &ws, "fn-missing", &json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["message"], "Function fn-missing not found");
}

#[tokio::test]
async fn test_logs_newest_first_with_limit() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&endpoint)
        .await;

    let app = test_app(Config::for_testing());
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;
    point_at(&app, &ws, &fid, &endpoint.uri()).await;

    let mut log_ids = Vec::new();
    for i in 0..3 {
        let (_, result) = invoke(&app, &ws, &fid, &json!({ "n": i })).await;
        log_ids.push(result["logId"].as_str().unwrap().to_string());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (status, body) = app
        .get(&format!("/api/workspaces/{}/functions/{}/logs?limit=2", ws, fid))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["logs"][0]["id"], log_ids[2].as_str());
    assert_eq!(body["logs"][1]["id"], log_ids[1].as_str());
}

const DISCOVERY_DOMAIN: &str = "functions.test";

/// App whose derived function addresses resolve to the given mock server
fn app_with_discovery(endpoint: &MockServer) -> TestApp {
    let mut config = Config::for_testing();
    config.fallback_service_suffix = format!("{}:{}", DISCOVERY_DOMAIN, endpoint.address().port());

    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let client = reqwest::Client::builder()
        .no_proxy()
        .resolve(&format!("hello.{}", DISCOVERY_DOMAIN), loopback)
        .build()
        .unwrap();

    test_app_with_function_client(config, client)
}

#[tokio::test]
async fn test_derived_address_is_recorded_after_success() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&endpoint)
        .await;

    let app = app_with_discovery(&endpoint);
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;

    let (status, result) = invoke(&app, &ws, &fid, &json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "success");

    let (_, function) = app
        .get(&format!("/api/workspaces/{}/functions/{}", ws, fid))
        .await;
    assert_eq!(
        function["invocationUrl"],
        format!("http://hello.{}:{}", DISCOVERY_DOMAIN, endpoint.address().port())
    );
}

#[tokio::test]
async fn test_derived_address_not_recorded_after_failure() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&endpoint)
        .await;

    let app = app_with_discovery(&endpoint);
    let ws = app.create_workspace("demo").await;
    let fid = app.create_function(&ws, "hello").await;

    let (status, result) = invoke(&app, &ws, &fid, &json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "error");
    assert_eq!(result["statusCode"], 503);

    let (_, function) = app
        .get(&format!("/api/workspaces/{}/functions/{}", ws, fid))
        .await;
    assert!(function["invocationUrl"].is_null());
    assert_eq!(function["errors24h"], 1);
}
