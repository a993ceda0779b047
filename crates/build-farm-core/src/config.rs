// Node configuration
// Decision: All environment lookups happen here, once, at startup.
// Every field documents its precedence: explicit variable first, computed default second.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default listen port when `BUILDER_PORT` is not set
pub const DEFAULT_PORT: u16 = 8443;

/// Default zstd release served by the tool download site
pub const DEFAULT_ZSTD_VERSION: &str = "1.5.5";

/// Default base URL the zstd binaries are downloaded from
pub const DEFAULT_ZSTD_DOWNLOAD_URL: &str =
    "https://github.com/develar/app-builder/releases/download/zstd";

/// Relative location of the build CLI inside the node module tree
pub const BUILD_SCRIPT_RELATIVE_PATH: &str =
    "node_modules/app-builder-lib/out/remoteBuilder/builder-cli.js";

const DEFAULT_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// No default could be computed for a required setting
    #[error("cannot determine {0}")]
    Unresolvable(&'static str),
}

/// Which discovery registry backend to register in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryBackend {
    /// etcd v3 JSON gateway
    Etcd,
    /// Process-local registry (local runs and tests)
    Memory,
}

/// IP family used for the external address lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Host prefix understood by the lookup service (`ipv4.` / `ipv6.`)
    pub fn host_prefix(self) -> &'static str {
        match self {
            IpVersion::V4 => "ipv4.",
            IpVersion::V6 => "ipv6.",
        }
    }
}

/// Discovery registration settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub backend: DiscoveryBackend,
    /// etcd JSON gateway endpoint (`ETCD_ENDPOINT`)
    pub etcd_endpoint: String,
    /// Prefix prepended to `address:port` (`BUILDER_KEY_PREFIX`)
    pub key_prefix: String,
    /// Lease time-to-live (`BUILDER_LEASE_TTL_SECS`)
    pub lease_ttl: Duration,
    /// Explicit external address (`BUILDER_HOST`), trimmed
    pub host_override: Option<String>,
    /// Preferred IP family for the lookup (`PREFERRED_IP_VERSION`)
    pub preferred_ip_version: Option<IpVersion>,
    /// Full lookup URL override (`IP_LOOKUP_URL`)
    pub ip_lookup_url: Option<String>,
}

impl DiscoveryConfig {
    /// URL of the external IP lookup service, honouring the preferred IP version
    pub fn ip_lookup_url(&self) -> String {
        if let Some(url) = &self.ip_lookup_url {
            return url.clone();
        }
        let prefix = self
            .preferred_ip_version
            .map(IpVersion::host_prefix)
            .unwrap_or("");
        format!("https://{prefix}myexternalip.com/raw")
    }
}

/// Compression tool download settings
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Base URL (`ZSTD_DOWNLOAD_URL`)
    pub download_url: String,
    /// Release version (`ZSTD_VERSION`)
    pub version: String,
    /// Where downloaded binaries are cached
    pub cache_dir: PathBuf,
}

/// Node configuration, resolved once at startup
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen port (`BUILDER_PORT`)
    pub port: u16,
    /// Root for the default stage/tmp/cache directories (`BUILDER_DATA_DIR`)
    pub data_dir: PathBuf,
    /// Explicit temp directory (`BUILDER_TMP_DIR`), validated before use
    pub tmp_dir_override: Option<PathBuf>,
    /// Keep per-job scratch directories after a build (`KEEP_TMP_DIR_AFTER_BUILD`)
    pub keep_tmp_dir_after_build: bool,
    /// Interpreter running the build CLI (`BUILDER_NODE`)
    pub node_binary: String,
    /// Build CLI location, derived from `BUILDER_NODE_MODULES`
    pub script_path: PathBuf,
    /// Number of pool workers (`BUILDER_WORKERS`)
    pub worker_count: usize,
    /// Per-job execution limit (`BUILDER_JOB_TIMEOUT_SECS`)
    pub job_timeout: Duration,
    /// Drain grace period (`BUILDER_SHUTDOWN_TIMEOUT_SECS`)
    pub shutdown_timeout: Duration,
    /// How long finished job records stay queryable (`BUILDER_JOB_RETENTION_SECS`)
    pub job_retention: Duration,
    /// Upload size limit for build submissions (`BUILDER_MAX_UPLOAD_BYTES`)
    pub max_upload_bytes: u64,
    pub discovery: DiscoveryConfig,
    pub tool: ToolConfig,
}

impl NodeConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let data_dir = match var("BUILDER_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };

        let script_root = match var("BUILDER_NODE_MODULES") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let exe = std::env::current_exe()
                    .map_err(|_| ConfigError::Unresolvable("executable location"))?;
                exe.parent()
                    .ok_or(ConfigError::Unresolvable("executable directory"))?
                    .join("../..")
            }
        };

        let preferred_ip_version = match var("PREFERRED_IP_VERSION").as_deref() {
            None => None,
            Some("4") => Some(IpVersion::V4),
            Some("6") => Some(IpVersion::V6),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "PREFERRED_IP_VERSION",
                    value: other.to_string(),
                    reason: "expected 4 or 6".to_string(),
                })
            }
        };

        let backend = match var("BUILDER_DISCOVERY").as_deref() {
            None | Some("etcd") => DiscoveryBackend::Etcd,
            Some("memory") => DiscoveryBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "BUILDER_DISCOVERY",
                    value: other.to_string(),
                    reason: "expected etcd or memory".to_string(),
                })
            }
        };

        let worker_count = match var("BUILDER_WORKERS") {
            Some(v) => parse::<usize>("BUILDER_WORKERS", &v)?.max(1),
            None => default_worker_count(),
        };

        Ok(Self {
            port: var("BUILDER_PORT")
                .map(|v| parse("BUILDER_PORT", &v))
                .transpose()?
                .unwrap_or(DEFAULT_PORT),
            tmp_dir_override: var("BUILDER_TMP_DIR").map(PathBuf::from),
            keep_tmp_dir_after_build: lookup("KEEP_TMP_DIR_AFTER_BUILD").is_some(),
            node_binary: var("BUILDER_NODE").unwrap_or_else(|| "node".to_string()),
            script_path: script_root.join(BUILD_SCRIPT_RELATIVE_PATH),
            worker_count,
            job_timeout: secs(&var, "BUILDER_JOB_TIMEOUT_SECS", 3600)?,
            shutdown_timeout: secs(&var, "BUILDER_SHUTDOWN_TIMEOUT_SECS", 60)?,
            job_retention: secs(&var, "BUILDER_JOB_RETENTION_SECS", 3600)?,
            max_upload_bytes: var("BUILDER_MAX_UPLOAD_BYTES")
                .map(|v| parse("BUILDER_MAX_UPLOAD_BYTES", &v))
                .transpose()?
                .unwrap_or(DEFAULT_UPLOAD_LIMIT),
            discovery: DiscoveryConfig {
                backend,
                etcd_endpoint: var("ETCD_ENDPOINT")
                    .unwrap_or_else(|| "http://127.0.0.1:2379".to_string()),
                key_prefix: var("BUILDER_KEY_PREFIX").unwrap_or_else(|| "/builders/".to_string()),
                lease_ttl: secs(&var, "BUILDER_LEASE_TTL_SECS", 30)?,
                host_override: var("BUILDER_HOST").map(|h| h.trim().to_string()),
                preferred_ip_version,
                ip_lookup_url: var("IP_LOOKUP_URL"),
            },
            tool: ToolConfig {
                download_url: var("ZSTD_DOWNLOAD_URL")
                    .unwrap_or_else(|| DEFAULT_ZSTD_DOWNLOAD_URL.to_string()),
                version: var("ZSTD_VERSION").unwrap_or_else(|| DEFAULT_ZSTD_VERSION.to_string()),
                cache_dir: data_dir.join("cache"),
            },
            data_dir,
        })
    }

    /// Default stage directory (`<data dir>/stage`)
    pub fn stage_dir(&self) -> PathBuf {
        self.data_dir.join("stage")
    }

    /// Default temp directory (`<data dir>/tmp`)
    pub fn default_tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }
}

/// One more worker than available processing units
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 1
}

fn default_data_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|dir| dir.join("build-farm"))
        .ok_or(ConfigError::Unresolvable("data directory"))
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn secs<F>(var: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = var(name)
        .map(|v| parse::<u64>(name, &v))
        .transpose()?
        .unwrap_or(default);
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<NodeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[
            ("BUILDER_DATA_DIR", "/srv/builder"),
            ("BUILDER_NODE_MODULES", "/opt/builder"),
        ])
        .unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.stage_dir(), PathBuf::from("/srv/builder/stage"));
        assert_eq!(config.default_tmp_dir(), PathBuf::from("/srv/builder/tmp"));
        assert_eq!(
            config.script_path,
            PathBuf::from("/opt/builder").join(BUILD_SCRIPT_RELATIVE_PATH)
        );
        assert_eq!(config.worker_count, default_worker_count());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.job_retention, Duration::from_secs(3600));
        assert_eq!(config.discovery.backend, DiscoveryBackend::Etcd);
        assert_eq!(config.discovery.lease_ttl, Duration::from_secs(30));
        assert!(config.tmp_dir_override.is_none());
        assert!(!config.keep_tmp_dir_after_build);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BUILDER_DATA_DIR", "/srv/builder"),
            ("BUILDER_NODE_MODULES", "/opt/builder"),
            ("BUILDER_PORT", "9000"),
            ("BUILDER_TMP_DIR", "/scratch/builds"),
            ("BUILDER_HOST", "  10.0.0.5 \n"),
            ("BUILDER_WORKERS", "0"),
            ("BUILDER_DISCOVERY", "memory"),
            ("KEEP_TMP_DIR_AFTER_BUILD", ""),
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.tmp_dir_override, Some(PathBuf::from("/scratch/builds")));
        assert_eq!(config.discovery.host_override.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.discovery.backend, DiscoveryBackend::Memory);
        assert!(config.keep_tmp_dir_after_build);
    }

    #[test]
    fn test_ip_lookup_url_honours_preferred_version() {
        let base = [
            ("BUILDER_DATA_DIR", "/srv/builder"),
            ("BUILDER_NODE_MODULES", "/opt/builder"),
        ];
        let config = config_from(&base).unwrap();
        assert_eq!(
            config.discovery.ip_lookup_url(),
            "https://myexternalip.com/raw"
        );

        let mut vars = base.to_vec();
        vars.push(("PREFERRED_IP_VERSION", "6"));
        let config = config_from(&vars).unwrap();
        assert_eq!(
            config.discovery.ip_lookup_url(),
            "https://ipv6.myexternalip.com/raw"
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = config_from(&[
            ("BUILDER_DATA_DIR", "/srv/builder"),
            ("BUILDER_NODE_MODULES", "/opt/builder"),
            ("BUILDER_PORT", "not-a-port"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("BUILDER_PORT"));

        let err = config_from(&[
            ("BUILDER_DATA_DIR", "/srv/builder"),
            ("BUILDER_NODE_MODULES", "/opt/builder"),
            ("PREFERRED_IP_VERSION", "5"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PREFERRED_IP_VERSION", .. }));
    }
}
