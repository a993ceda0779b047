// Shared DTOs and error mapping for the HTTP surface

use axum::http::StatusCode;
use axum::Json;
use build_farm_core::JobId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error body returned by every rejecting endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn internal_error() -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Parse a job reference from the URL; anything malformed is simply unknown
pub fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| api_error(StatusCode::NOT_FOUND, format!("Job {raw} not found")))
}
