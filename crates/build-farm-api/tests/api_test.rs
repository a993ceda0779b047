// HTTP surface: submission, job status, downloads, admission control

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use build_farm_api::{build_router, AppState, RateLimits};
use build_farm_core::{BuildDirs, BuildRequest, JobId};
use build_farm_worker::{
    BuildExecutor, ExecutionContext, ExecutionError, WorkerPool, WorkerPoolConfig,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Stands in for the build CLI: copies the uploaded spec into an artifact
struct CopySpecExecutor;

#[async_trait]
impl BuildExecutor for CopySpecExecutor {
    async fn execute(
        &self,
        request: &BuildRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let spec = tokio::fs::read(&request.spec_file).await?;
        tokio::fs::create_dir_all(ctx.output_dir.join("mac")).await?;
        tokio::fs::write(ctx.output_dir.join("mac/App.dmg"), spec).await?;
        Ok(())
    }
}

struct TestNode {
    app: Router,
    pool: Arc<WorkerPool>,
    dirs: BuildDirs,
    _root: tempfile::TempDir,
}

async fn node_with_limit(max_upload_bytes: u64) -> TestNode {
    let root = tempfile::tempdir().unwrap();
    let dirs = BuildDirs::new(root.path().join("stage"), root.path().join("tmp"));
    dirs.prepare().await.unwrap();

    let pool = Arc::new(WorkerPool::start(
        WorkerPoolConfig::new("/cache/zstd").with_worker_count(2),
        dirs.clone(),
        Arc::new(CopySpecExecutor),
    ));
    let state = AppState {
        pool: Arc::clone(&pool),
        dirs: dirs.clone(),
        max_upload_bytes,
    };
    TestNode {
        app: build_router(state, &RateLimits::default()),
        pool,
        dirs,
        _root: root,
    }
}

async fn node() -> TestNode {
    node_with_limit(1024 * 1024).await
}

fn submit(client: &str, body: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v2/build")
        .header("x-forwarded-for", client)
        .header("x-platform", "mac")
        .header("x-targets", "dmg")
        .header("x-zstd-compression-level", "3")
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.10")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for_completion(app: &Router, id: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let response = app
                .clone()
                .oneshot(get(&format!("/v2/jobs/{id}")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let record = json_body(response).await;
            if record["status"] == "completed" || record["status"] == "failed" {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish")
}

#[tokio::test]
async fn test_submit_build_then_download_artifact() {
    let node = node().await;

    let response = node
        .app
        .clone()
        .oneshot(submit("198.51.100.1", b"electron-builder config"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = json_body(response).await;
    assert_eq!(accepted["status"], "queued");
    let id = accepted["id"].as_str().unwrap().to_string();

    let record = wait_for_completion(&node.app, &id).await;
    assert_eq!(record["status"], "completed", "{record}");
    assert_eq!(record["artifacts"], serde_json::json!(["mac/App.dmg"]));
    assert_eq!(record["metadata"]["zstd_compression_level"], 3);

    let response = node
        .app
        .clone()
        .oneshot(get(&format!("/v2/download/{id}/mac/App.dmg")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "23");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"electron-builder config");

    // Scratch space, including the uploaded spec, is gone
    assert!(!node.dirs.job_tmp_dir(&id).exists());
}

#[tokio::test]
async fn test_download_unknown_reference_is_not_found() {
    let node = node().await;

    let response = node
        .app
        .clone()
        .oneshot(get(&format!("/v2/download/{}/mac/App.dmg", JobId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = node
        .app
        .clone()
        .oneshot(get(&format!("/v2/jobs/{}", JobId::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_job_reference_is_json_not_found() {
    let node = node().await;

    for uri in ["/v2/download/not-a-job/mac/App.dmg", "/v2/jobs/not-a-job"] {
        let response = node.app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        let body = json_body(response).await;
        assert_eq!(body["error"], "Job not-a-job not found", "{uri}");
    }
}

#[tokio::test]
async fn test_download_rejects_path_traversal() {
    let node = node().await;
    let id = JobId::new();
    std::fs::create_dir_all(node.dirs.job_stage_dir(id)).unwrap();
    std::fs::write(node.dirs.stage_dir().join("secret"), b"nope").unwrap();

    let response = node
        .app
        .clone()
        .oneshot(get(&format!("/v2/download/{id}/mac/../../secret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_headers_rejected_without_side_effects() {
    let node = node().await;

    let request = Request::builder()
        .method("POST")
        .uri("/v2/build")
        .header("x-platform", "linux")
        .body(Body::from("spec"))
        .unwrap();
    let response = node.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "Header x-targets is not specified");
    assert_eq!(std::fs::read_dir(node.dirs.tmp_dir()).unwrap().count(), 0);
    assert_eq!(node.pool.running_jobs().get(), 0);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let node = node_with_limit(8).await;

    let response = node
        .app
        .clone()
        .oneshot(submit("198.51.100.2", b"far more than eight bytes"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(std::fs::read_dir(node.dirs.tmp_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_build_endpoint_rate_limited_per_client() {
    let node = node().await;

    let no_headers = |client: &str| {
        Request::builder()
            .method("POST")
            .uri("/v2/build")
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    };

    // Admission runs before validation, so rejected requests still spend tokens
    for _ in 0..10 {
        let response = node.app.clone().oneshot(no_headers("203.0.113.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    let response = node.app.clone().oneshot(no_headers("203.0.113.9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    let response = node.app.clone().oneshot(no_headers("203.0.113.10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Job status is never rate limited
    for _ in 0..20 {
        let response = node
            .app
            .clone()
            .oneshot(get(&format!("/v2/jobs/{}", JobId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_submission_refused_while_draining() {
    let node = node().await;
    node.pool.stop_accepting();

    let response = node
        .app
        .clone()
        .oneshot(submit("198.51.100.3", b"spec"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(std::fs::read_dir(node.dirs.tmp_dir()).unwrap().count(), 0);

    let response = node.app.clone().oneshot(get("/health")).await.unwrap();
    let health = json_body(response).await;
    assert_eq!(health["status"], "draining");
}

#[tokio::test]
async fn test_draining_node_refuses_upload_before_reading_it() {
    let node = node_with_limit(8).await;
    node.pool.stop_accepting();

    // Over the upload limit: a 413 here would mean the body was streamed to disk
    let response = node
        .app
        .clone()
        .oneshot(submit("198.51.100.4", b"far more than eight bytes"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"], "Node is shutting down");
    assert_eq!(std::fs::read_dir(node.dirs.tmp_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_health_reports_capacity() {
    let node = node().await;

    let response = node.app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health = json_body(response).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["workers"], 2);
    assert_eq!(health["running_jobs"], 0);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let node = node().await;

    let response = node
        .app
        .clone()
        .oneshot(get("/api-doc/openapi.json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc = json_body(response).await;
    assert!(doc["paths"]["/v2/build"].is_object());
}
