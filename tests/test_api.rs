//! Tests for the HTTP adapter.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use flowpulse::api::{AppState, router};
use flowpulse::engine::{Aggregator, AggregatorHandle, AggregatorService, ServiceSettings};
use flowpulse::probes::ProcessTable;

fn build_test_app() -> (Router, AggregatorHandle) {
    let handle = AggregatorService::spawn(Aggregator::default(), ServiceSettings::default());
    let state = Arc::new(AppState {
        handle: handle.clone(),
        processes: Arc::new(ProcessTable::new()),
    });
    (router(state), handle)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, handle) = build_test_app();

    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ok");

    handle.shutdown().await;
}

#[tokio::test]
async fn start_returns_handle_and_record_is_listed() {
    let (app, handle) = build_test_app();

    let resp = app
        .clone()
        .oneshot(post_json(
            "/events",
            serde_json::json!({ "type": "start", "name": "deploy", "total_steps": 3 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let started = json_body(resp).await;
    assert_eq!(started["workflow_name"], "deploy");
    assert_eq!(started["correlation_token"].as_str().unwrap().len(), 36);

    let resp = app
        .clone()
        .oneshot(post_json(
            "/events",
            serde_json::json!({ "type": "step", "name": "deploy", "step": "build", "status": "completed" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["applied"], true);

    let resp = app.clone().oneshot(get("/workflows")).await.unwrap();
    let list = json_body(resp).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let resp = app.oneshot(get("/workflows/deploy")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record = json_body(resp).await;
    assert_eq!(record["completed_steps"], 1);
    assert_eq!(record["success_rate"], 100.0);
    assert_eq!(record["status"], "running");

    handle.shutdown().await;
}

#[tokio::test]
async fn event_for_unknown_workflow_returns_404() {
    let (app, handle) = build_test_app();

    let resp = app
        .oneshot(post_json(
            "/events",
            serde_json::json!({
                "type": "end",
                "name": "ghost",
                "result": { "success": true, "completed_names": [], "failed_names": [] }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_workflow_lookup_returns_404() {
    let (app, handle) = build_test_app();

    let resp = app.clone().oneshot(get("/workflows/nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = Request::builder()
        .method("DELETE")
        .uri("/workflows/nope")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    handle.shutdown().await;
}

#[tokio::test]
async fn empty_workflow_name_is_rejected() {
    let (app, handle) = build_test_app();

    let resp = app
        .oneshot(post_json(
            "/events",
            serde_json::json!({ "type": "start", "name": "  ", "total_steps": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    handle.shutdown().await;
}

#[tokio::test]
async fn stopped_service_returns_503() {
    let (app, handle) = build_test_app();
    handle.shutdown().await;

    let resp = app.oneshot(get("/workflows")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn process_registration_round_trip() {
    let (app, handle) = build_test_app();

    let req = Request::builder()
        .method("PUT")
        .uri("/processes/exec-1")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"pid": 1234}"#))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri("/processes/exec-1")
            .body(Body::empty())
            .unwrap()
    };
    let resp = app.clone().oneshot(delete()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = app.oneshot(delete()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    handle.shutdown().await;
}

#[tokio::test]
async fn event_stream_opens_with_snapshot() {
    let (app, handle) = build_test_app();

    let resp = app.oneshot(get("/events/stream")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let mut body = resp.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let chunk = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(chunk.starts_with("event: snapshot\n"));
    assert!(chunk.contains("\"workflows\":[]"));

    handle.shutdown().await;
}
