use crate::model::BucketCategory;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the file ingestion engine
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Scratch storage configuration
    #[serde(default)]
    pub scratch: ScratchConfig,
    /// Per-bucket upload size caps
    #[serde(default)]
    pub limits: UploadLimitsConfig,
    /// Object store configuration
    pub object_store: ObjectStoreConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Garbage collection configuration
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Scratch storage for in-flight operations
#[derive(Debug, Clone, Deserialize)]
pub struct ScratchConfig {
    /// Root directory for per-operation scratch directories
    #[serde(default = "default_scratch_root")]
    pub root: String,
}

/// Upload size caps, in MiB, enforced before any hashing or store work
#[derive(Debug, Clone, Deserialize)]
pub struct UploadLimitsConfig {
    #[serde(default = "default_max_icon_size_mib")]
    pub max_icon_size_mib: u64,
    #[serde(default = "default_max_emoji_size_mib")]
    pub max_emoji_size_mib: u64,
    #[serde(default = "default_max_sticker_size_mib")]
    pub max_sticker_size_mib: u64,
    #[serde(default = "default_max_attachment_size_mib")]
    pub max_attachment_size_mib: u64,
}

impl UploadLimitsConfig {
    /// Byte cap for a bucket category
    pub fn max_bytes(&self, bucket: BucketCategory) -> u64 {
        let mib = match bucket {
            BucketCategory::Icons => self.max_icon_size_mib,
            BucketCategory::Emojis => self.max_emoji_size_mib,
            BucketCategory::Stickers => self.max_sticker_size_mib,
            BucketCategory::Attachments => self.max_attachment_size_mib,
        };
        mib << 20
    }
}

/// Object store configuration: ordered region backends, first is primary
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Region backends in priority order. Writes and primary reads target
    /// the first entry; deletes fan out to all of them.
    pub regions: Vec<RegionConfig>,
}

/// One region-scoped S3 backend
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    /// Logical region name recorded on File records (e.g. "us-east")
    pub name: String,
    /// AWS region
    #[serde(default = "default_aws_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Garbage collection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Age in seconds after which unclaimed records are deleted
    #[serde(default = "default_unclaimed_ttl_secs")]
    pub unclaimed_ttl_secs: u64,
    /// Interval between GC sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "filestore".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_scratch_root() -> String {
    "/var/tmp/filestore".to_string()
}

fn default_max_icon_size_mib() -> u64 {
    8
}

fn default_max_emoji_size_mib() -> u64 {
    2
}

fn default_max_sticker_size_mib() -> u64 {
    8
}

fn default_max_attachment_size_mib() -> u64 {
    50
}

fn default_aws_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_unclaimed_ttl_secs() -> u64 {
    1800 // 30 minutes
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "filestore")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/filestore").required(false))
            .add_source(config::File::with_name("/etc/filestore/config").required(false))
            // Override with environment variables
            // FILESTORE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("FILESTORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get unclaimed-record TTL as Duration
    pub fn unclaimed_ttl(&self) -> Duration {
        Duration::from_secs(self.lifecycle.unclaimed_ttl_secs)
    }

    /// Get GC sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.sweep_interval_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root: default_scratch_root(),
        }
    }
}

impl Default for UploadLimitsConfig {
    fn default() -> Self {
        Self {
            max_icon_size_mib: default_max_icon_size_mib(),
            max_emoji_size_mib: default_max_emoji_size_mib(),
            max_sticker_size_mib: default_max_sticker_size_mib(),
            max_attachment_size_mib: default_max_attachment_size_mib(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            unclaimed_ttl_secs: default_unclaimed_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_unclaimed_ttl_secs(), 1800);
        assert_eq!(default_sweep_interval_secs(), 300);
        assert_eq!(default_scratch_root(), "/var/tmp/filestore");
    }

    #[test]
    fn test_limit_bytes() {
        let limits = UploadLimitsConfig::default();
        assert_eq!(limits.max_bytes(BucketCategory::Emojis), 2 << 20);
        assert_eq!(limits.max_bytes(BucketCategory::Attachments), 50 << 20);
    }
}
