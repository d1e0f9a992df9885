//! Integration tests for the clinical demonstration server's HTTP routes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use clinical_core::compose::{
    DefaultBeautifyPromptComposer, EchoLlmClient, NoOfflineBeautifier, PermissiveValidator,
    Pipeline,
};
use clinical_server::state::AppState;

fn test_router() -> axum::Router {
    let pipeline = Arc::new(Pipeline::new(
        Box::new(EchoLlmClient),
        Box::new(NoOfflineBeautifier),
        Box::new(DefaultBeautifyPromptComposer),
        Box::new(PermissiveValidator),
    ));
    let state = Arc::new(AppState::new(pipeline, Duration::from_millis(500)));
    clinical_server::build_router(state)
}

async fn get_json(router: axum::Router, path: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .uri(path)
        .body(Body::empty())
        .expect("build request");
    let response = router.oneshot(req).await.expect("send request");
    let status = response.status();
    let body = response.into_body().collect().await.expect("read body");
    let json: serde_json::Value = serde_json::from_slice(&body.to_bytes()).expect("parse JSON");
    (status, json)
}

async fn post_json(
    router: axum::Router,
    path: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .expect("build request");
    let response = router.oneshot(req).await.expect("send request");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("read body");
    let json: serde_json::Value = serde_json::from_slice(&bytes.to_bytes()).expect("parse JSON");
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() {
    let (status, body) = get_json(test_router(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_channel_upgrade_is_not_found() {
    let req = Request::builder()
        .uri("/ws/unknown?encounterId=e1")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .expect("build request");
    let response = test_router().oneshot(req).await.expect("send request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn compose_runs_pipeline_to_completion() {
    let job = serde_json::json!({
        "composeId": 1,
        "note": "<p>Subjective:</p><p>patient feels better today.</p>",
        "codes": [{"code": "99213", "title": "Office visit"}],
        "encounterId": "enc-1",
    });
    let (status, body) = post_json(test_router(), "/compose", job).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"], 1.0);
}

#[test]
fn gate_request_fixture_carries_the_given_note_id() {
    let request = clinical_core::fixtures::gate_request("n2");
    assert_eq!(request.note_id.as_deref(), Some("n2"));
    assert!(!request.text.is_empty());
}
