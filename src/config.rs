//! Service configuration.
//!
//! One YAML file configures both roles; a process acts as coordinator,
//! node, or both depending on which sections are present. The file path
//! comes from the `ASTACUS_CONFIG` environment variable or the command
//! line.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use serde::Deserialize;

use crate::common::objectstorage::ObjectStorageConfig;

pub const CONFIG_ENV: &str = "ASTACUS_CONFIG";

fn default_root_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default)]
    pub coordinator: Option<CoordinatorConfig>,
    #[serde(default)]
    pub node: Option<NodeConfig>,
    pub object_storage: ObjectStorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Accepted for compatibility; telemetry sinks are not part of the
    /// core and a configured DSN is only reported at startup.
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_host")]
    pub host: String,
    #[serde(default = "HttpConfig::default_port")]
    pub port: u16,
}

impl HttpConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        5515
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorNode {
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub nodes: Vec<CoordinatorNode>,
    /// Lease TTL in seconds; renewal happens at TTL/2.
    #[serde(default = "CoordinatorConfig::default_lock_ttl")]
    pub default_lock_ttl: u64,
    #[serde(default = "CoordinatorConfig::default_backup_attempts")]
    pub backup_attempts: u32,
    #[serde(default = "CoordinatorConfig::default_restore_attempts")]
    pub restore_attempts: u32,
    /// Result poll delay growth: start, multiplier, maximum (seconds).
    #[serde(default = "CoordinatorConfig::default_poll_delay_start")]
    pub poll_delay_start: f64,
    #[serde(default = "CoordinatorConfig::default_poll_delay_multiplier")]
    pub poll_delay_multiplier: f64,
    #[serde(default = "CoordinatorConfig::default_poll_delay_max")]
    pub poll_delay_max: f64,
    /// Consecutive per-node poll misses tolerated before aborting.
    #[serde(default = "CoordinatorConfig::default_poll_maximum_failures")]
    pub poll_maximum_failures: u32,
    /// On a transport-level relock problem the renewal loop sleeps
    /// `ttl / relock_retry_divisor` before retrying, which yields about
    /// divisor/2 attempts before the lease deadline passes.
    #[serde(default = "CoordinatorConfig::default_relock_retry_divisor")]
    pub relock_retry_divisor: u32,
    #[serde(default = "CoordinatorConfig::default_plugin")]
    pub plugin: String,
    /// Globs the nodes snapshot, from the active plugin's point of view.
    #[serde(default = "default_root_globs")]
    pub root_globs: Vec<String>,
    /// Local directory caching manifest JSON documents; the cache is
    /// authoritative for list and download once written through.
    #[serde(default)]
    pub object_storage_cache: Option<PathBuf>,
}

impl CoordinatorConfig {
    fn default_lock_ttl() -> u64 {
        60
    }

    fn default_backup_attempts() -> u32 {
        5
    }

    fn default_restore_attempts() -> u32 {
        5
    }

    fn default_poll_delay_start() -> f64 {
        0.1
    }

    fn default_poll_delay_multiplier() -> f64 {
        2.0
    }

    fn default_poll_delay_max() -> f64 {
        60.0
    }

    fn default_poll_maximum_failures() -> u32 {
        5
    }

    fn default_relock_retry_divisor() -> u32 {
        10
    }

    fn default_plugin() -> String {
        "files".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// The live data directory backups are taken of.
    pub root: PathBuf,
    /// Where the hashed hard-link mirror lives. Must be on the same
    /// filesystem as `root`.
    pub snapshot_root: PathBuf,
    #[serde(default)]
    pub parallel: ParallelConfig,
    /// Files at or below this size are embedded into the manifest
    /// instead of being stored as blobs.
    #[serde(default = "NodeConfig::default_embed_limit")]
    pub embed_limit: u64,
}

impl NodeConfig {
    fn default_embed_limit() -> u64 {
        100
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelConfig {
    #[serde(default = "ParallelConfig::default_parallel")]
    pub uploads: usize,
    #[serde(default = "ParallelConfig::default_parallel")]
    pub downloads: usize,
}

impl ParallelConfig {
    fn default_parallel() -> usize {
        1
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            uploads: Self::default_parallel(),
            downloads: Self::default_parallel(),
        }
    }
}

impl GlobalConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)
            .map_err(|err| format_err!("unable to read config {:?}: {}", path, err))?;
        let config: GlobalConfig = serde_yaml::from_slice(&data)
            .map_err(|err| format_err!("unable to parse config {:?}: {}", path, err))?;
        if config.coordinator.is_none() && config.node.is_none() {
            bail!("config {:?} enables neither coordinator nor node role", path);
        }
        Ok(config)
    }
}
