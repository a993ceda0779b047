// Artifact download endpoint

use std::path::{Component, Path, PathBuf};

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::common::{api_error, internal_error, parse_job_id, ApiError, ErrorResponse};
use crate::AppState;

/// Validate a client-supplied artifact path, keeping it inside the job's
/// stage directory
pub fn sanitize_artifact_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim_start_matches('/');
    if raw.is_empty() {
        return None;
    }

    let mut clean = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Download a build artifact
#[utoipa::path(
    get,
    path = "/v2/download/{job_id}/{path}",
    params(
        ("job_id" = String, Path, description = "Job ID"),
        ("path" = String, Path, description = "Artifact path relative to the job output"),
    ),
    responses(
        (status = 200, description = "Artifact bytes", body = Vec<u8>, content_type = "application/octet-stream"),
        (status = 400, description = "Invalid artifact path", body = ErrorResponse),
        (status = 404, description = "Artifact not found", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    ),
    tag = "artifacts"
)]
pub async fn download_artifact(
    State(state): State<AppState>,
    UrlPath((job_id, path)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let relative = sanitize_artifact_path(&path)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Invalid artifact path"))?;
    let file_path = state.dirs.job_stage_dir(job_id).join(&relative);

    let not_found = || {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Artifact {} not found", relative.display()),
        )
    };

    let file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => {
            tracing::error!(path = %file_path.display(), "Failed to open artifact: {}", e);
            return Err(internal_error());
        }
    };
    let metadata = file.metadata().await.map_err(|e| {
        tracing::error!(path = %file_path.display(), "Failed to stat artifact: {}", e);
        internal_error()
    })?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    tracing::debug!(job_id = %job_id, path = %relative.display(), size = metadata.len(), "Serving artifact");

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_accepts_nested_paths() {
        assert_eq!(
            sanitize_artifact_path("mac/App-1.0.dmg"),
            Some(PathBuf::from("mac/App-1.0.dmg"))
        );
        assert_eq!(
            sanitize_artifact_path("/./latest.yml"),
            Some(PathBuf::from("latest.yml"))
        );
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert_eq!(sanitize_artifact_path("../secret"), None);
        assert_eq!(sanitize_artifact_path("mac/../../etc/passwd"), None);
        assert_eq!(sanitize_artifact_path(""), None);
        assert_eq!(sanitize_artifact_path("./"), None);
    }
}
