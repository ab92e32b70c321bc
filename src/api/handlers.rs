//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::core::types::{JobId, TimeSlice};
use crate::jobs::JobsService;
use crate::scheduler::SchedulerHandle;
use crate::storage::Storage;

use super::errors::ApiError;
use super::responses::{
    ActiveQueueResponse, HealthResponse, JobListResponse, JobResponse, MessageResponse,
    SchedulerStateResponse, SliceStatusResponse,
};

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub handle: SchedulerHandle<S>,
    pub jobs: Arc<JobsService<S>>,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            jobs: Arc::clone(&self.jobs),
        }
    }
}

/// Body of `POST /api/jobs/delete-tenant`.
#[derive(Debug, Deserialize)]
pub struct DeleteTenantRequest {
    pub tenant_id: String,
}

/// Body of `POST /api/jobs/delete-metric`.
#[derive(Debug, Deserialize)]
pub struct DeleteMetricRequest {
    pub tenant_id: String,
    pub metric_type: String,
    pub metric_name: String,
}

/// Body of `POST /api/jobs/compress`.
#[derive(Debug, Deserialize)]
pub struct CompressRequest {
    /// Epoch millis the block is derived from.
    pub timestamp: i64,
    pub block_size: Option<String>,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Get scheduler state.
pub async fn get_scheduler_state<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Json<SchedulerStateResponse> {
    let scheduler_state = state.handle.state().await;
    Json(SchedulerStateResponse::new(
        scheduler_state,
        state.handle.node_id().as_str(),
    ))
}

/// Pause the scheduler.
pub async fn pause_scheduler<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle.pause().await?;
    Ok(Json(MessageResponse {
        message: "scheduler paused".to_string(),
    }))
}

/// Resume the scheduler.
pub async fn resume_scheduler<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle.resume().await?;
    Ok(Json(MessageResponse {
        message: "scheduler resumed".to_string(),
    }))
}

/// Get the active queue pointer.
pub async fn get_active_queue<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<ActiveQueueResponse>, ApiError> {
    let pointer = state.handle.active_queue().await?;
    let current = state.handle.slice_of(state.handle.now());
    Ok(Json(ActiveQueueResponse::new(
        pointer,
        current,
        state.handle.slice_width(),
    )))
}

/// Get the index sets of the slice containing `timestamp_ms`.
pub async fn get_slice<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(timestamp_ms): Path<i64>,
) -> Result<Json<SliceStatusResponse>, ApiError> {
    let slice = TimeSlice::from_timestamp_millis(timestamp_ms, state.handle.slice_width())
        .ok_or_else(|| ApiError::BadRequest(format!("timestamp out of range: {}", timestamp_ms)))?;
    let status = state.handle.slice_status(slice).await?;
    Ok(Json(SliceStatusResponse::from(status)))
}

/// List all persisted jobs.
pub async fn list_jobs<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<JobListResponse>, ApiError> {
    let width = state.handle.slice_width();
    let jobs: Vec<JobResponse> = state
        .handle
        .list_jobs()
        .await?
        .into_iter()
        .map(|job| JobResponse::new(job, width))
        .collect();
    let count = jobs.len();
    Ok(Json(JobListResponse { jobs, count }))
}

/// Get a specific job.
pub async fn get_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id: JobId = job_id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("invalid job id: {}", job_id)))?;
    let job = state.handle.get_job(&job_id).await?;
    Ok(Json(JobResponse::new(job, state.handle.slice_width())))
}

/// Schedule a tenant deletion.
pub async fn submit_delete_tenant<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<DeleteTenantRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state.jobs.submit_delete_tenant(&request.tenant_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(JobResponse::new(job, state.handle.slice_width())),
    ))
}

/// Schedule a metric deletion.
pub async fn submit_delete_metric<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<DeleteMetricRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state
        .jobs
        .submit_delete_metric(
            &request.tenant_id,
            &request.metric_type,
            &request.metric_name,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(JobResponse::new(job, state.handle.slice_width())),
    ))
}

/// Schedule a one-off compression.
pub async fn submit_compress<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<CompressRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job = state
        .jobs
        .submit_compress(request.timestamp, request.block_size.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(JobResponse::new(job, state.handle.slice_width())),
    ))
}
