//! Integration tests for the control API

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use helpers::*;
use http_body_util::BodyExt;
use reindex_watcher::models::{EntityType, Priority, ReindexRequest};
use reindex_watcher::{build_router, AppState, Reindexer};
use serde_json::Value;
use std::sync::Arc;
use tower::util::ServiceExt;

async fn create_test_app() -> (axum::Router, Reindexer) {
    let reindexer = create_test_reindexer(
        &test_config(),
        Arc::new(FakeSource::default()),
        Arc::new(MemoryDocumentStore::default()),
    )
    .await;
    let state = AppState::new(reindexer.worker.clone(), reindexer.events.clone());
    (build_router(state), reindexer)
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post(app: axum::Router, uri: &str) -> StatusCode {
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
    .status()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, reindexer) = create_test_app().await;
    let request = ReindexRequest::new(EntityType::Page, ["1"], "default", Priority::Normal).unwrap();
    reindexer.job_creator.create_reindex_job(&request).await.unwrap();

    let (status, body) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "reindex-watcher");
    assert_eq!(body["inactive_jobs"], 1);
    assert_eq!(body["active_jobs"], 0);
    assert_eq!(body["paused"], false);
}

#[tokio::test]
async fn test_pause_and_resume_endpoints() {
    let (app, reindexer) = create_test_app().await;

    assert_eq!(post(app.clone(), "/pause").await, StatusCode::NO_CONTENT);
    assert!(reindexer.worker.is_paused().await.unwrap());
    let (_, body) = get_json(app.clone(), "/health").await;
    assert_eq!(body["status"], "paused");

    assert_eq!(post(app.clone(), "/resume").await, StatusCode::NO_CONTENT);
    assert!(!reindexer.worker.is_paused().await.unwrap());
    let (_, body) = get_json(app, "/health").await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_unknown_route_returns_not_found() {
    let (app, _reindexer) = create_test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
