// Build job model
// Decision: The build specification is opaque; the node only stores it and hands
// its path to the build executable. Metadata comes from request headers.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "openapi")]
use utoipa::ToSchema;
use uuid::Uuid;

/// Job identifier (UUID v7, ordered by submission time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(transparent)]
#[cfg_attr(feature = "openapi", schema(value_type = String))]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Metadata sent alongside a build specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct BuildMetadata {
    /// Target platform (`x-platform` header)
    pub platform: String,
    /// Requested build targets (`x-targets` header)
    pub targets: Vec<String>,
    /// zstd compression level for the produced archive; -1 means tool default
    pub zstd_compression_level: i32,
}

/// A submitted build: an opaque specification on disk plus metadata
///
/// Immutable once created.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub id: JobId,
    /// Uploaded build specification, stored verbatim
    pub spec_file: PathBuf,
    pub metadata: BuildMetadata,
    pub submitted_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(id: JobId, spec_file: PathBuf, metadata: BuildMetadata) -> Self {
        Self {
            id,
            spec_file,
            metadata,
            submitted_at: Utc::now(),
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job has reached `Completed` or `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Externally visible job record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub metadata: BuildMetadata,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Artifact paths relative to the job's stage directory
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    /// Record for a freshly queued request
    pub fn queued(request: &BuildRequest) -> Self {
        Self {
            id: request.id,
            status: JobStatus::Queued,
            metadata: request.metadata.clone(),
            submitted_at: request.submitted_at,
            started_at: None,
            finished_at: None,
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, artifacts: Vec<String>) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.artifacts = artifacts;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}
