//! Compression tool provisioning
//!
//! Ensures the zstd binary the build executable needs is present locally.
//! Each (OS, architecture) pair is downloaded at most once and cached next to
//! a digest marker; later calls verify the marker and skip the network.

use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::ToolConfig;

/// Provisioning errors (all fatal at startup)
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No published binary for this platform
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// Download failed
    #[error("cannot download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Download site answered with an error status
    #[error("cannot download {url}: status {status}")]
    Status { url: String, status: u16 },

    /// Downloaded bytes don't match the published digest
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Local filesystem error
    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Operating systems a tool binary is published for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Mac,
    Windows,
}

/// CPU architectures a tool binary is published for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X64,
    Arm64,
}

/// Download cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    /// Platform of the running process
    pub fn current() -> Result<Self, ProvisionError> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Map Rust target names onto published platform names
    pub fn from_parts(os: &str, arch: &str) -> Result<Self, ProvisionError> {
        let unsupported = || ProvisionError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };
        let os = match os {
            "linux" => Os::Linux,
            "macos" => Os::Mac,
            "windows" => Os::Windows,
            _ => return Err(unsupported()),
        };
        let arch = match arch {
            "x86_64" => Arch::X64,
            "aarch64" => Arch::Arm64,
            _ => return Err(unsupported()),
        };
        Ok(Self { os, arch })
    }

    fn executable_name(self) -> &'static str {
        match self.os {
            Os::Windows => "zstd.exe",
            Os::Linux | Os::Mac => "zstd",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = match self.os {
            Os::Linux => "linux",
            Os::Mac => "mac",
            Os::Windows => "win",
        };
        let arch = match self.arch {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
        };
        write!(f, "{os}-{arch}")
    }
}

/// Downloads and caches the zstd binary
pub struct ToolProvisioner {
    config: ToolConfig,
    http: reqwest::Client,
}

impl ToolProvisioner {
    pub fn new(config: ToolConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: ToolConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    /// Cached binary location for a platform
    pub fn cached_path(&self, platform: Platform) -> PathBuf {
        self.platform_dir(platform).join(platform.executable_name())
    }

    /// Return the binary for `platform`, downloading it if no valid copy is cached
    pub async fn ensure(&self, platform: Platform) -> Result<PathBuf, ProvisionError> {
        let path = self.cached_path(platform);

        if self.is_cached(&path).await {
            tracing::debug!(path = %path.display(), %platform, "Using cached zstd");
            return Ok(path);
        }

        let url = format!(
            "{}/{}/{}/{}",
            self.config.download_url.trim_end_matches('/'),
            self.config.version,
            platform,
            platform.executable_name()
        );
        tracing::info!(%url, %platform, "Downloading zstd");

        let expected = self.fetch_text(&format!("{url}.sha256")).await?;
        let expected = expected
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let bytes = self.fetch_bytes(&url).await?;

        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != expected {
            return Err(ProvisionError::ChecksumMismatch {
                url,
                expected,
                actual,
            });
        }

        self.install(&path, &bytes, &actual).await?;
        tracing::info!(path = %path.display(), "zstd provisioned");
        Ok(path)
    }

    fn platform_dir(&self, platform: Platform) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("zstd-{}", self.config.version))
            .join(platform.to_string())
    }

    async fn is_cached(&self, path: &Path) -> bool {
        let Ok(marker) = tokio::fs::read_to_string(marker_path(path)).await else {
            return false;
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => hex::encode(Sha256::digest(&bytes)) == marker.trim(),
            Err(_) => false,
        }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ProvisionError> {
        let download = |source| ProvisionError::Download {
            url: url.to_string(),
            source,
        };
        let response = self.http.get(url).send().await.map_err(download)?;
        if !response.status().is_success() {
            return Err(ProvisionError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(download)?;
        Ok(bytes.to_vec())
    }

    async fn fetch_text(&self, url: &str) -> Result<String, ProvisionError> {
        let bytes = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write via temp file + rename so a crash never leaves a half-written binary
    async fn install(&self, path: &Path, bytes: &[u8], digest: &str) -> Result<(), ProvisionError> {
        let io = |source| ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(dir).await.map_err(io)?;

        let partial = path.with_extension("download");
        tokio::fs::write(&partial, bytes).await.map_err(io)?;
        set_executable(&partial).await.map_err(io)?;
        tokio::fs::rename(&partial, path).await.map_err(io)?;
        tokio::fs::write(marker_path(path), digest).await.map_err(io)?;
        Ok(())
    }
}

fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".sha256");
    path.with_file_name(name)
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
