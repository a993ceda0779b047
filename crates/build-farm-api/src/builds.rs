// Build submission and job status endpoints

use std::path::Path;

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use build_farm_core::{BuildMetadata, BuildRequest, JobId, JobRecord, JobStatus};
use build_farm_worker::{WorkerPoolError, WorkerPoolStatus};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use utoipa::ToSchema;

use crate::common::{api_error, internal_error, parse_job_id, ApiError, ErrorResponse};
use crate::AppState;

pub const TARGETS_HEADER: &str = "x-targets";
pub const PLATFORM_HEADER: &str = "x-platform";
pub const COMPRESSION_LEVEL_HEADER: &str = "x-zstd-compression-level";

/// File name of the uploaded build spec inside the job's scratch directory
pub const SPEC_FILE_NAME: &str = "spec";

const DEFAULT_COMPRESSION_LEVEL: i32 = -1;

/// Returned once a build is queued
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitBuildResponse {
    pub id: JobId,
    pub status: JobStatus,
}

/// Parse build metadata from request headers
///
/// `x-targets` may be repeated or comma-separated.
pub fn parse_metadata(headers: &HeaderMap) -> Result<BuildMetadata, ApiError> {
    let targets: Vec<String> = headers
        .get_all(TARGETS_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect();
    if targets.is_empty() {
        return Err(missing_header(TARGETS_HEADER));
    }

    let platform = headers
        .get(PLATFORM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing_header(PLATFORM_HEADER))?
        .to_string();

    let zstd_compression_level = match headers.get(COMPRESSION_LEVEL_HEADER) {
        None => DEFAULT_COMPRESSION_LEVEL,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    format!("Header {COMPRESSION_LEVEL_HEADER} must be an integer"),
                )
            })?,
    };

    Ok(BuildMetadata {
        platform,
        targets,
        zstd_compression_level,
    })
}

fn missing_header(name: &str) -> ApiError {
    api_error(
        StatusCode::BAD_REQUEST,
        format!("Header {name} is not specified"),
    )
}

/// Submit a build
#[utoipa::path(
    post,
    path = "/v2/build",
    request_body(content = Vec<u8>, description = "Opaque build spec", content_type = "application/octet-stream"),
    params(
        ("x-targets" = String, Header, description = "Comma-separated build targets"),
        ("x-platform" = String, Header, description = "Target platform"),
        ("x-zstd-compression-level" = Option<i32>, Header, description = "Artifact compression level, -1 for default"),
    ),
    responses(
        (status = 202, description = "Build queued", body = SubmitBuildResponse),
        (status = 400, description = "Missing or invalid headers", body = ErrorResponse),
        (status = 413, description = "Build spec too large", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 503, description = "Node is shutting down", body = ErrorResponse)
    ),
    tag = "builds"
)]
pub async fn submit_build(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<SubmitBuildResponse>), ApiError> {
    let metadata = parse_metadata(&headers)?;
    if state.pool.status() != WorkerPoolStatus::Running {
        return Err(shutting_down());
    }

    let id = JobId::new();
    let job_tmp_dir = state.dirs.job_tmp_dir(id);
    let spec_file = job_tmp_dir.join(SPEC_FILE_NAME);

    if let Err(e) = receive_spec(body, &job_tmp_dir, &spec_file, state.max_upload_bytes).await {
        discard(&job_tmp_dir).await;
        return Err(e);
    }

    let request = BuildRequest::new(id, spec_file, metadata);
    match state.pool.submit(request) {
        Ok(id) => {
            tracing::info!(job_id = %id, "Build accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitBuildResponse {
                    id,
                    status: JobStatus::Queued,
                }),
            ))
        }
        Err(WorkerPoolError::NotAccepting) => {
            discard(&job_tmp_dir).await;
            Err(shutting_down())
        }
        Err(e) => {
            tracing::error!("Failed to queue build: {}", e);
            discard(&job_tmp_dir).await;
            Err(internal_error())
        }
    }
}

fn shutting_down() -> ApiError {
    api_error(StatusCode::SERVICE_UNAVAILABLE, "Node is shutting down")
}

async fn receive_spec(
    body: Body,
    job_tmp_dir: &Path,
    spec_file: &Path,
    max_bytes: u64,
) -> Result<u64, ApiError> {
    tokio::fs::create_dir_all(job_tmp_dir).await.map_err(|e| {
        tracing::error!("Failed to create job directory: {}", e);
        internal_error()
    })?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(spec_file)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create spec file: {}", e);
            internal_error()
        })?;

    let mut written: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::warn!("Build upload interrupted: {}", e);
            api_error(StatusCode::BAD_REQUEST, "Cannot read request body")
        })?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(api_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Build spec exceeds {max_bytes} bytes"),
            ));
        }
        file.write_all(&chunk).await.map_err(|e| {
            tracing::error!("Failed to write spec file: {}", e);
            internal_error()
        })?;
    }

    file.flush().await.map_err(|e| {
        tracing::error!("Failed to flush spec file: {}", e);
        internal_error()
    })?;
    Ok(written)
}

async fn discard(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), "Cannot remove rejected upload: {}", e);
        }
    }
}

/// Get a job's status and artifacts
#[utoipa::path(
    get,
    path = "/v2/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job found", body = JobRecord),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    ),
    tag = "builds"
)]
pub async fn get_job(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state
        .pool
        .job(job_id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Job {job_id} not found")))
}
