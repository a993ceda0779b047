// Build farm core
//
// Node configuration, stage/temp directory management, compression tool
// provisioning and the build job model shared by the worker and API crates.

pub mod config;
pub mod directories;
pub mod job;
pub mod provision;

pub use config::{ConfigError, DiscoveryBackend, DiscoveryConfig, IpVersion, NodeConfig, ToolConfig};
pub use directories::{validate_tmp_dir, BuildDirs, DirError};
pub use job::{BuildMetadata, BuildRequest, JobId, JobRecord, JobStatus};
pub use provision::{Arch, Os, Platform, ProvisionError, ToolProvisioner};
