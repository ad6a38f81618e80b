use std::sync::Arc;

use ai_request_orchestrator::{
    backend::{mock::MockBackend, BackendAdapter, BackendError},
    build_app,
    config::{BackendConfig, OrchestratorConfig},
    orchestrator::Orchestrator,
    state::AppState,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::util::ServiceExt;

async fn app_with(backends: Vec<(&str, MockBackend)>) -> Router {
    let orchestrator = Arc::new(Orchestrator::new(OrchestratorConfig::default()));
    orchestrator
        .initialize_with(
            backends
                .into_iter()
                .map(|(id, backend)| (BackendConfig::mock(id), BackendAdapter::from(backend)))
                .collect(),
        )
        .await
        .expect("initialization should succeed");
    build_app(AppState::new(orchestrator))
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .expect("request build")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request build")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    String::from_utf8(bytes.to_vec()).expect("response body should be UTF-8")
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).expect("body should be JSON")
}

#[tokio::test]
async fn generate_returns_normalized_response() {
    let app = app_with(vec![(
        "mock-a",
        MockBackend::named("mock-a").with_reply("drafted letter"),
    )])
    .await;

    let response = app
        .oneshot(post_json(
            "/v1/generate",
            r#"{"task":"cover_letter","parts":[{"modality":"text","text":"write"}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["backend"], "mock-a");
    assert_eq!(body["content"]["text"], "drafted letter");
    assert!(body["request_id"]
        .as_str()
        .expect("request id")
        .starts_with("req_"));
}

#[tokio::test]
async fn generate_without_capable_backend_is_unprocessable() {
    let app = app_with(vec![("mock-a", MockBackend::named("mock-a"))]).await;

    let response = app
        .oneshot(post_json(
            "/v1/generate",
            r#"{"parts":[{"modality":"audio","mime_type":"audio/wav","data":"UklGRg=="}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "no_capable_backend");
}

#[tokio::test]
async fn adapter_failure_maps_to_bad_gateway() {
    let app = app_with(vec![(
        "mock-a",
        MockBackend::named("mock-a").failing(BackendError::Auth("revoked key".to_owned())),
    )])
    .await;

    let response = app
        .oneshot(post_json(
            "/v1/generate",
            r#"{"parts":[{"modality":"text","text":"hi"}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["kind"], "auth");
}

#[tokio::test]
async fn failed_race_lists_each_backend() {
    let app = app_with(vec![
        (
            "mock-a",
            MockBackend::named("mock-a").failing(BackendError::Network("reset".to_owned())),
        ),
        (
            "mock-b",
            MockBackend::named("mock-b").failing(BackendError::Timeout("slow".to_owned())),
        ),
    ])
    .await;

    let response = app
        .oneshot(post_json(
            "/v1/generate",
            r#"{"parts":[{"modality":"text","text":"hi"}],"mode":"concurrent"}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "aggregate_failure");
    assert_eq!(
        body["error"]["failures"]
            .as_array()
            .expect("failures array")
            .len(),
        2
    );
}

#[tokio::test]
async fn empty_parts_are_rejected() {
    let app = app_with(vec![("mock-a", MockBackend::named("mock-a"))]).await;

    let response = app
        .oneshot(post_json("/v1/generate", r#"{"parts":[]}"#))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_endpoint_emits_start_chunks_and_completion() {
    let app = app_with(vec![(
        "mock-a",
        MockBackend::named("mock-a").with_chunks(["Hel", "lo", " world"]),
    )])
    .await;

    let response = app
        .oneshot(post_json(
            "/v1/generate/stream",
            r#"{"parts":[{"modality":"text","text":"greet"}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    assert!(body.contains("event: start"));
    assert_eq!(body.matches("event: chunk").count(), 3);
    assert!(body.contains("event: complete"));
    assert!(body.contains("\"content\":\"Hello world\""));
}

#[tokio::test]
async fn models_can_be_listed_and_switched() {
    let app = app_with(vec![("mock-a", MockBackend::named("mock-a"))]).await;

    let switched = app
        .clone()
        .oneshot(post_json(
            "/v1/models/switch",
            r#"{"backend":"mock-a","model":"mock-large"}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(switched.status(), StatusCode::OK);

    let unknown = app
        .clone()
        .oneshot(post_json(
            "/v1/models/switch",
            r#"{"backend":"mock-a","model":"nope"}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let listed = app
        .oneshot(get("/v1/models"))
        .await
        .expect("request execution");
    let body = body_json(listed).await;
    let active = body["models"]
        .as_array()
        .expect("models array")
        .iter()
        .filter(|model| model["active"] == true)
        .map(|model| model["id"].as_str().expect("model id").to_owned())
        .collect::<Vec<_>>();
    assert_eq!(active, vec!["mock-large"]);
}

#[tokio::test]
async fn health_and_metrics_endpoints_report_backends() {
    let app = app_with(vec![
        ("mock-a", MockBackend::named("mock-a")),
        ("mock-b", MockBackend::named("mock-b")),
    ])
    .await;

    let generated = app
        .clone()
        .oneshot(post_json(
            "/v1/generate",
            r#"{"parts":[{"modality":"text","text":"hi"}]}"#,
        ))
        .await
        .expect("request execution");
    assert_eq!(generated.status(), StatusCode::OK);

    let health = app
        .clone()
        .oneshot(get("/v1/health"))
        .await
        .expect("request execution");
    let body = body_json(health).await;
    assert_eq!(body["overview"]["healthy_count"], 2);
    assert_eq!(body["overview"]["total_count"], 2);
    assert_eq!(body["backends"].as_array().expect("backends").len(), 2);

    let performance = app
        .clone()
        .oneshot(get("/v1/performance"))
        .await
        .expect("request execution");
    let body = body_json(performance).await;
    assert_eq!(body["records"].as_array().expect("records").len(), 1);

    let metrics = app
        .oneshot(get("/metrics"))
        .await
        .expect("request execution");
    let body = body_text(metrics).await;
    assert!(body.contains("orchestrator_backend_requests_total"));
    assert!(body.contains("orchestrator_backend_health{backend=\"mock-b\"} 2"));
    assert!(body.contains("orchestrator_http_requests_total"));
}
