//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

mod common;
use common::{DEFAULT_MODEL, OTHER_MODEL, test_app};

async fn get_json(uri: &str) -> (StatusCode, Value) {
    send(Method::GET, uri).await
}

async fn send(method: Method, uri: &str) -> (StatusCode, Value) {
    let response = test_app()
        .oneshot(
            Request::builder()
                .uri(uri)
                .method(method)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (status, json) = get_json("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert!(json["timestamp"].is_string());
    assert_eq!(json["sessions"], 0);
}

#[tokio::test]
async fn test_list_models() {
    let (status, json) = get_json("/api/models").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["models"], serde_json::json!([DEFAULT_MODEL, OTHER_MODEL]));
    assert_eq!(json["default"], DEFAULT_MODEL);
}

#[tokio::test]
async fn test_list_sessions_empty() {
    let (status, json) = get_json("/api/sessions").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!([]));
}

#[tokio::test]
async fn test_cancel_unknown_session() {
    let uri = format!("/api/sessions/{}", Uuid::new_v4());
    let (status, json) = send(Method::DELETE, &uri).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_invalid_session_id() {
    let (status, json) = send(Method::DELETE, "/api/sessions/not-a-uuid").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_unknown_route() {
    let (status, _) = get_json("/api/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
