// Build farm node HTTP surface
//
// Admission control, build/download routes, discovery registration and the
// shutdown disposer. The binary in main.rs wires these together.

pub mod admission;
pub mod artifacts;
pub mod builds;
pub mod common;
pub mod disposer;
pub mod registrar;
pub mod registry;
pub mod shutdown;

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use build_farm_core::{BuildDirs, BuildMetadata, JobRecord, JobStatus};
use build_farm_worker::{WorkerPool, WorkerPoolStatus};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

pub use admission::{RateLimitConfig, RateLimiter, RateLimits};
pub use disposer::Disposer;
pub use registrar::{host_port, AgentEntry, AgentInfo, AgentRegistrar, RegistrarError};
pub use registry::{DiscoveryRegistry, EtcdRegistry, InMemoryRegistry, LeaseId, RegistryError};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub dirs: BuildDirs,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub workers: usize,
    pub running_jobs: usize,
}

/// Node health and load
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Node status", body = HealthResponse)),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.pool.status() {
        WorkerPoolStatus::Running => "ok",
        WorkerPoolStatus::Draining => "draining",
        WorkerPoolStatus::Stopped => "stopped",
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        workers: state.pool.worker_count(),
        running_jobs: state.pool.running_jobs().get(),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        builds::submit_build,
        builds::get_job,
        artifacts::download_artifact,
        health,
    ),
    components(
        schemas(
            builds::SubmitBuildResponse,
            common::ErrorResponse,
            HealthResponse,
            JobRecord, JobStatus, BuildMetadata,
        )
    ),
    tags(
        (name = "builds", description = "Build submission and job status"),
        (name = "artifacts", description = "Artifact downloads"),
        (name = "health", description = "Node health")
    ),
    info(
        title = "Build Farm Node API",
        version = "0.2.0",
        description = "Remote build node: accepts builds, runs them on a bounded worker pool and serves artifacts",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

/// Assemble every route with its admission layer
///
/// Build submission and downloads are rate limited per client; job status and
/// health are not.
pub fn build_router(state: AppState, limits: &RateLimits) -> Router {
    let build_routes = Router::new()
        .route("/v2/build", post(builds::submit_build))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&limits.builds),
            admission::rate_limit,
        ));

    let download_routes = Router::new()
        .route(
            "/v2/download/:job_id/*path",
            get(artifacts::download_artifact),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&limits.downloads),
            admission::rate_limit,
        ));

    let open_routes = Router::new()
        .route("/v2/jobs/:job_id", get(builds::get_job))
        .route("/health", get(health));

    Router::new()
        .merge(build_routes)
        .merge(download_routes)
        .merge(open_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
}
