//! HTTP API module for the slicer scheduler.
//!
//! Provides REST endpoints for submitting maintenance jobs, inspecting
//! slices and jobs, and controlling the scheduler.

mod errors;
mod handlers;
mod responses;

pub use errors::ApiError;
pub use handlers::{ApiState, CompressRequest, DeleteMetricRequest, DeleteTenantRequest};
pub use responses::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::jobs::JobsService;
use crate::storage::Storage;

/// Build the API router with all endpoints.
pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Scheduler control
        .route(
            "/api/scheduler/state",
            get(handlers::get_scheduler_state::<S>),
        )
        .route("/api/scheduler/pause", post(handlers::pause_scheduler::<S>))
        .route(
            "/api/scheduler/resume",
            post(handlers::resume_scheduler::<S>),
        )
        .route(
            "/api/scheduler/active-queue",
            get(handlers::get_active_queue::<S>),
        )
        // Slices
        .route("/api/slices/{timestamp_ms}", get(handlers::get_slice::<S>))
        // Jobs
        .route("/api/jobs", get(handlers::list_jobs::<S>))
        .route("/api/jobs/{job_id}", get(handlers::get_job::<S>))
        .route(
            "/api/jobs/delete-tenant",
            post(handlers::submit_delete_tenant::<S>),
        )
        .route(
            "/api/jobs/delete-metric",
            post(handlers::submit_delete_metric::<S>),
        )
        .route("/api/jobs/compress", post(handlers::submit_compress::<S>))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from the jobs service.
pub fn create_api_state<S: Storage + 'static>(jobs: Arc<JobsService<S>>) -> ApiState<S> {
    ApiState {
        handle: jobs.scheduler().clone(),
        jobs,
    }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: Storage + 'static>(
    addr: SocketAddr,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
