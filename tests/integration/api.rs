//! API integration tests.
//!
//! Requests go straight through the router with `oneshot`, against a
//! manually ticked node on in-memory storage.

use crate::common::{WIDTH, slice, start_time};
use slicer::api::{ApiState, build_router, create_api_state};
use slicer::testing::{RecordingMetricsService, StaticConfigurationService};
use slicer::{InMemoryStorage, JobsService, ManualClock, Scheduler, SchedulerHandle};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApi {
    state: ApiState<InMemoryStorage>,
    handle: SchedulerHandle<InMemoryStorage>,
}

/// Start a node with the built-in jobs and wrap it in API state.
async fn create_test_api() -> TestApi {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = ManualClock::new(start_time());
    let (handle, _task) = Scheduler::with_storage(storage)
        .with_clock(Arc::new(clock))
        .with_slice_width(WIDTH)
        .with_manual_ticks()
        .start()
        .await;

    let service = JobsService::new(
        handle.clone(),
        Arc::new(RecordingMetricsService::new()),
        Arc::new(StaticConfigurationService::new()),
    );
    service.start().await.unwrap();

    TestApi {
        state: create_api_state(Arc::new(service)),
        handle,
    }
}

async fn send(state: &ApiState<InMemoryStorage>, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let api = create_test_api().await;

    let (status, json) = send(&api.state, get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Test: Scheduler state reports the node and follows pause/resume.
#[tokio::test]
async fn test_pause_and_resume() {
    let api = create_test_api().await;

    let (status, json) = send(&api.state, get("/api/scheduler/state")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["node_id"], api.handle.node_id().as_str());

    let (status, _) = send(&api.state, post("/api/scheduler/pause", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&api.state, get("/api/scheduler/state")).await;
    assert_eq!(json["state"], "paused");
    assert_eq!(json["is_paused"], true);

    let (status, _) = send(&api.state, post("/api/scheduler/resume", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&api.state, get("/api/scheduler/state")).await;
    assert_eq!(json["is_running"], true);

    api.handle.shutdown().await.unwrap();
}

/// Test: Active queue starts at the slice the node was started in.
#[tokio::test]
async fn test_active_queue_endpoint() {
    let api = create_test_api().await;

    let (status, json) = send(&api.state, get("/api/scheduler/active-queue")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["active_queue_ms"], slice(0).timestamp_millis());
    assert_eq!(json["lag"], 0);

    api.handle.shutdown().await.unwrap();
}

/// Test: A tenant deletion is scheduled one minute out and can be fetched.
#[tokio::test]
async fn test_submit_delete_tenant() {
    let api = create_test_api().await;

    let (status, created) = send(
        &api.state,
        post("/api/jobs/delete-tenant", json!({ "tenant_id": "acme" })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["job_type"], "DELETE_TENANT");
    assert_eq!(created["parameters"]["tenantId"], "acme");
    assert_eq!(created["time_slice"], serde_json::to_value(slice(1)).unwrap());

    let job_id = created["job_id"].as_str().unwrap();
    let (status, fetched) = send(&api.state, get(&format!("/api/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["job_id"], job_id);

    let (_, listed) = send(&api.state, get("/api/jobs")).await;
    assert_eq!(listed["count"], 1);

    let uri = format!("/api/slices/{}", slice(1).timestamp_millis());
    let (status, slice_json) = send(&api.state, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(slice_json["scheduled"], json!([job_id]));
    assert_eq!(slice_json["pending"], 1);

    api.handle.shutdown().await.unwrap();
}

/// Test: A metric deletion with a known type is accepted.
#[tokio::test]
async fn test_submit_delete_metric() {
    let api = create_test_api().await;

    let (status, created) = send(
        &api.state,
        post(
            "/api/jobs/delete-metric",
            json!({ "tenant_id": "acme", "metric_type": "gauge", "metric_name": "cpu" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["parameters"]["metricType"], "gauge");

    let (status, json) = send(
        &api.state,
        post(
            "/api/jobs/delete-metric",
            json!({ "tenant_id": "acme", "metric_type": "histogram", "metric_name": "cpu" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");

    api.handle.shutdown().await.unwrap();
}

/// Test: Invalid submissions are rejected and nothing is persisted.
#[tokio::test]
async fn test_invalid_submissions_rejected() {
    let api = create_test_api().await;

    let (status, _) = send(
        &api.state,
        post("/api/jobs/delete-tenant", json!({ "tenant_id": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &api.state,
        post(
            "/api/jobs/compress",
            json!({ "timestamp": start_time().timestamp_millis(), "block_size": "soon" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(api.handle.list_jobs().await.unwrap().is_empty());

    api.handle.shutdown().await.unwrap();
}

/// Test: A one-off compression is accepted with a valid block size.
#[tokio::test]
async fn test_submit_compress() {
    let api = create_test_api().await;

    let (status, created) = send(
        &api.state,
        post(
            "/api/jobs/compress",
            json!({ "timestamp": start_time().timestamp_millis(), "block_size": "2h" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["job_type"], "COMPRESS_DATA");
    assert_eq!(created["parameters"]["blockSize"], "2h");

    api.handle.shutdown().await.unwrap();
}

/// Test: Unknown and malformed job ids return 404.
#[tokio::test]
async fn test_unknown_job_returns_404() {
    let api = create_test_api().await;

    let (status, json) = send(
        &api.state,
        get("/api/jobs/00000000-0000-0000-0000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    let (status, _) = send(&api.state, get("/api/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    api.handle.shutdown().await.unwrap();
}

/// Test: Submitting to a stopped node returns 503.
#[tokio::test]
async fn test_submit_after_shutdown_unavailable() {
    let api = create_test_api().await;
    api.handle.shutdown().await.unwrap();

    let (status, json) = send(
        &api.state,
        post("/api/jobs/delete-tenant", json!({ "tenant_id": "acme" })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("stopped"));

    let (_, listed) = send(&api.state, get("/api/jobs")).await;
    assert_eq!(listed["count"], 0);
}
