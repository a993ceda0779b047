// Build step execution
// Decision: The build executable is opaque. The worker invokes it, waits for it,
// and maps its exit status onto the job state. No retries at this layer.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use build_farm_core::BuildRequest;
use thiserror::Error;
use tokio::process::Command;

/// Longest stderr excerpt kept in a failed job's error message
const ERROR_EXCERPT_LEN: usize = 4096;

/// Errors from a single build step
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The build executable could not be started or its I/O failed
    #[error("cannot run build executable: {0}")]
    Io(#[from] std::io::Error),

    /// The build executable exited unsuccessfully
    #[error("build failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    /// The build executable ran longer than allowed and was killed
    #[error("build timed out after {0:?}")]
    Timeout(Duration),
}

/// Inputs handed to the build executable alongside the request
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Where artifacts must be written (`stage/<job-id>`)
    pub output_dir: PathBuf,
    /// Per-job scratch directory
    pub tmp_dir: PathBuf,
    /// Provisioned zstd binary
    pub tool_path: PathBuf,
}

/// Runs one build
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &BuildRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError>;
}

/// Invokes the build CLI script through an interpreter (`node builder-cli.js`)
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    interpreter: String,
    script: PathBuf,
    timeout: Duration,
}

impl ScriptExecutor {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            timeout,
        }
    }

    fn command(&self, request: &BuildRequest, ctx: &ExecutionContext) -> Command {
        let mut command = Command::new(&self.interpreter);
        command
            .arg(&self.script)
            .current_dir(&ctx.tmp_dir)
            .env("BUILDER_JOB_ID", request.id.to_string())
            .env("BUILDER_SPEC_FILE", &request.spec_file)
            .env("BUILDER_OUTPUT_DIR", &ctx.output_dir)
            .env("BUILDER_JOB_TMP_DIR", &ctx.tmp_dir)
            .env("BUILDER_ZSTD_PATH", &ctx.tool_path)
            .env("BUILDER_PLATFORM", &request.metadata.platform)
            .env("BUILDER_TARGETS", request.metadata.targets.join(","))
            .env(
                "BUILDER_ZSTD_COMPRESSION_LEVEL",
                request.metadata.zstd_compression_level.to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must not leave an orphaned build
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl BuildExecutor for ScriptExecutor {
    async fn execute(
        &self,
        request: &BuildRequest,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        tracing::info!(
            job_id = %request.id,
            script = %self.script.display(),
            platform = %request.metadata.platform,
            "Executing build"
        );

        let output = tokio::time::timeout(self.timeout, self.command(request, ctx).output())
            .await
            .map_err(|_| ExecutionError::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            tracing::debug!(job_id = %request.id, output = %stdout, "Build output");
        }

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ExecutionError::Failed {
            status: output.status.to_string(),
            stderr: tail(stderr.trim(), ERROR_EXCERPT_LEN).to_string(),
        })
    }
}

/// Last `max` bytes of `text`, cut at a char boundary
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Files under `dir`, relative to it, `/`-separated and sorted
pub async fn collect_artifacts(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut artifacts = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && current == dir => break,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                let parts: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                artifacts.push(parts.join("/"));
            }
        }
    }

    artifacts.sort();
    Ok(artifacts)
}
