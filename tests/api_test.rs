use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use flate2::{Compression, write::GzEncoder};
use serde_json::{Value, json};
use std::io::Write;
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

use creditsync::api::{self, AppState};
use creditsync::config::Config;
use creditsync::engine::SyncContext;
use creditsync::identity::{IdentityProvider, WatchIdentity};
use creditsync::jobs::{JobDescriptor, JobType};
use creditsync::persist::MemoryKv;
use creditsync::remote::MockSyncApi;
use creditsync::sync::{PollKind, SyncLogKind};

struct TestApp {
    app: Router,
    context: Arc<SyncContext>,
    identity: Arc<WatchIdentity>,
}

/// Builds the control API over an in-memory engine signed in as `alice`
async fn build_test_app() -> TestApp {
    let api = Arc::new(MockSyncApi::new(100));
    let identity = Arc::new(WatchIdentity::resolved(Some("alice".to_string())));
    let context = SyncContext::initialize(
        Config::default(),
        api,
        Arc::new(MemoryKv::new()),
        identity.clone(),
    )
    .await
    .expect("Failed to initialize sync context");
    context.sync_now(PollKind::FullSync).await;

    let state = AppState::new(Arc::clone(&context)).with_identity(identity.clone());

    TestApp {
        app: api::router(state),
        context,
        identity,
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn paid_job(context: &SyncContext, cost: i64) -> String {
    let descriptor = JobDescriptor::builder()
        .job_type(JobType::TextToImage)
        .image_url("img://prompt")
        .build();
    context.begin_paid_job(descriptor, cost).await.unwrap()
}

#[tokio::test]
async fn test_notify_accepted() {
    let test = build_test_app().await;

    let response = test
        .app
        .oneshot(post_json("/notify", json!({ "reason": "job.updated" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["reason"], "job.updated");
}

#[tokio::test]
async fn test_notify_empty_body_is_a_ping() {
    let test = build_test_app().await;

    let request = Request::builder()
        .uri("/notify")
        .method("POST")
        .body(Body::empty())
        .unwrap();
    let response = test.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_notify_rejects_wrong_content_type() {
    let test = build_test_app().await;

    let request = Request::builder()
        .uri("/notify")
        .method("POST")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("{}"))
        .unwrap();
    let response = test.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn test_notify_rejects_oversized_payload() {
    let test = build_test_app().await;
    let limit = test.context.config().server.max_payload_bytes;

    let reason = "x".repeat(limit + 1);
    let response = test
        .app
        .oneshot(post_json("/notify", json!({ "reason": reason })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_visibility_and_connectivity() {
    let test = build_test_app().await;

    let response = test
        .app
        .clone()
        .oneshot(post_json("/visibility", json!({ "foreground": false })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!test.context.is_foreground());

    let response = test
        .app
        .clone()
        .oneshot(post_json("/connectivity", json!({ "online": false })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!test.context.is_online());

    let response = test
        .app
        .oneshot(post_json("/visibility", json!({ "visible": true })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_state_reports_balance_and_active_jobs() {
    let test = build_test_app().await;
    let job_id = paid_job(&test.context, 15).await;

    let response = test.app.oneshot(get("/state")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["identity"], "alice");
    assert_eq!(body["balance"], 85);
    assert_eq!(body["pending_deductions"], 15);
    assert_eq!(body["any_active"], true);
    assert_eq!(body["active_jobs"][0]["id"], job_id.as_str());
    assert_eq!(body["polling"]["full_sync"], "stopped");
}

#[tokio::test]
async fn test_get_job_and_not_found() {
    let test = build_test_app().await;
    let job_id = paid_job(&test.context, 5).await;

    let response = test
        .app
        .clone()
        .oneshot(get(&format!("/jobs/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");

    let response = test.app.oneshot(get("/jobs/job_missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_job_refunds_then_conflicts() {
    let test = build_test_app().await;
    let job_id = paid_job(&test.context, 10).await;
    let uri = format!("/jobs/{job_id}/cancel");

    let request = Request::builder()
        .uri(&uri)
        .method("POST")
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "cancelled");
    assert_eq!(test.context.balance().await, 100);

    let request = Request::builder()
        .uri(&uri)
        .method("POST")
        .body(Body::empty())
        .unwrap();
    let response = test.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_sync_log_dismiss() {
    let test = build_test_app().await;
    let entry = test
        .context
        .sync_log()
        .record(SyncLogKind::Network, "connection refused");

    let response = test.app.clone().oneshot(get("/sync-log")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["message"], "connection refused");

    let dismiss = |id: u64| {
        Request::builder()
            .uri(format!("/sync-log/{id}/dismiss"))
            .method("POST")
            .body(Body::empty())
            .unwrap()
    };

    let response = test.app.clone().oneshot(dismiss(entry)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(test.context.sync_log().visible().is_empty());

    let response = test.app.oneshot(dismiss(entry + 100)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sync_log_lists_oldest_first() {
    let test = build_test_app().await;
    let log = test.context.sync_log();
    log.record(SyncLogKind::Network, "timeout");
    log.record(SyncLogKind::Server, "HTTP 502");

    let response = test.app.oneshot(get("/sync-log")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body[0]["message"], "timeout");
    assert_eq!(body[1]["message"], "HTTP 502");
}

#[tokio::test]
async fn test_metrics_counts_polls() {
    let test = build_test_app().await;

    let response = test.app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["polls_completed"], 1);
}

#[tokio::test]
async fn test_health_reports_components() {
    let test = build_test_app().await;
    test.context.sync_now(PollKind::Health).await;

    let response = test.app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["store"], "healthy");
    assert_eq!(body["components"]["polling"], "stopped");
    assert_eq!(body["components"]["remote"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_health_reports_running_scheduler() {
    let test = build_test_app().await;
    test.context.start().await;

    let response = test.app.clone().oneshot(get("/health")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["components"]["polling"], "running");

    test.context.stop().await;
    let response = test.app.oneshot(get("/health")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["components"]["polling"], "stopped");
}

#[tokio::test]
async fn test_notify_accepts_gzip_body() {
    let test = build_test_app().await;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(br#"{"reason":"job.updated"}"#)
        .unwrap();
    let compressed = encoder.finish().unwrap();

    let request = Request::builder()
        .uri("/notify")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_ENCODING, "gzip")
        .body(Body::from(compressed))
        .unwrap();
    let response = test.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["reason"], "job.updated");
}

#[tokio::test]
async fn test_identity_endpoint_publishes_change() {
    let test = build_test_app().await;

    let response = test
        .app
        .oneshot(post_json("/identity", json!({ "identity": "bob" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(test.identity.current().as_deref(), Some("bob"));
}
