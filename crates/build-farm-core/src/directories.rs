//! Stage and temp directory management
//!
//! The stage directory holds finished artifacts (one subdirectory per job).
//! The temp directory holds per-job scratch space and is emptied wholesale on
//! every start, which is why an explicit override is validated first.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::config::NodeConfig;

/// Directory preparation errors
#[derive(Debug, Error)]
pub enum DirError {
    /// The configured temp directory would wipe unrelated data
    #[error("{} cannot be used as BUILDER_TMP_DIR because this dir will be emptied ({reason})", path.display())]
    UnsafeTmpDir { path: PathBuf, reason: &'static str },

    /// Home directory could not be resolved, so the override cannot be checked
    #[error("cannot resolve home directory to validate BUILDER_TMP_DIR")]
    NoHomeDir,

    /// Filesystem error while preparing a directory
    #[error("cannot prepare {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolved stage and temp directories
#[derive(Debug, Clone)]
pub struct BuildDirs {
    stage: PathBuf,
    tmp: PathBuf,
}

impl BuildDirs {
    /// Resolve directories from configuration, validating any temp override
    pub fn resolve(config: &NodeConfig) -> Result<Self, DirError> {
        let tmp = match &config.tmp_dir_override {
            Some(candidate) => {
                let home = dirs::home_dir().ok_or(DirError::NoHomeDir)?;
                let tmp = validate_tmp_dir(candidate, &std::env::temp_dir(), &home)?;
                reject_retained_ancestor(candidate, &tmp, config)?;
                tmp
            }
            None => config.default_tmp_dir(),
        };

        Ok(Self {
            stage: config.stage_dir(),
            tmp,
        })
    }

    /// Use explicit directories (no validation)
    pub fn new(stage: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            tmp: tmp.into(),
        }
    }

    /// Create the stage directory and empty the temp directory
    pub async fn prepare(&self) -> Result<(), DirError> {
        match tokio::fs::remove_dir_all(&self.tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(DirError::Io {
                    path: self.tmp.clone(),
                    source,
                })
            }
        }

        for dir in [&self.tmp, &self.stage] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| DirError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }

        tracing::debug!(stage = %self.stage.display(), tmp = %self.tmp.display(), "Directories prepared");
        Ok(())
    }

    pub fn stage_dir(&self) -> &Path {
        &self.stage
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// Artifact output directory of one job
    pub fn job_stage_dir(&self, job_id: impl std::fmt::Display) -> PathBuf {
        self.stage.join(job_id.to_string())
    }

    /// Scratch directory of one job
    pub fn job_tmp_dir(&self, job_id: impl std::fmt::Display) -> PathBuf {
        self.tmp.join(job_id.to_string())
    }
}

/// Reject temp directories whose wipe would destroy unrelated data
///
/// Refused: the OS default temp directory, the filesystem root, and the home
/// directory or any of its ancestors.
pub fn validate_tmp_dir(candidate: &Path, os_temp: &Path, home: &Path) -> Result<PathBuf, DirError> {
    let path = absolutize(candidate);
    let unsafe_dir = |reason| DirError::UnsafeTmpDir {
        path: candidate.to_path_buf(),
        reason,
    };

    if path.parent().is_none() {
        return Err(unsafe_dir("filesystem root"));
    }
    if path == absolutize(os_temp) {
        return Err(unsafe_dir("system temp directory"));
    }
    if absolutize(home).starts_with(&path) {
        return Err(unsafe_dir("home directory or one of its ancestors"));
    }

    Ok(path)
}

/// Emptying the temp dir must never reach artifacts or the tool cache
fn reject_retained_ancestor(
    candidate: &Path,
    tmp: &Path,
    config: &NodeConfig,
) -> Result<(), DirError> {
    let retained = [
        (config.stage_dir(), "stage directory or one of its ancestors"),
        (config.tool.cache_dir.clone(), "tool cache directory or one of its ancestors"),
    ];
    for (dir, reason) in retained {
        if absolutize(&dir).starts_with(tmp) {
            return Err(DirError::UnsafeTmpDir {
                path: candidate.to_path_buf(),
                reason,
            });
        }
    }
    Ok(())
}

/// Make a path absolute and lexically drop `.`/`..` components
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
