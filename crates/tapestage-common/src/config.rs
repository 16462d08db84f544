//! Configuration types for tapestage
//!
//! The daemon reads one TOML file. Every section has serde defaults so a
//! file only needs to list the pools it serves.

use crate::error::{Error, Result};
use crate::types::{POOL_NAME_MAX_LEN, PoolName};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Root configuration for tapestage
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon and network settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Garbage collection and retention defaults
    #[serde(default)]
    pub gc: GcConfig,
    /// Worker programs and dispatch limits
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Disk pools
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    /// Per file class retention and migration policy
    #[serde(default)]
    pub file_classes: Vec<FileClassConfig>,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for pool in &self.pools {
            PoolName::new(pool.name.as_str()).map_err(|e| {
                Error::configuration(format!(
                    "pool name '{}' (max {POOL_NAME_MAX_LEN}): {e}",
                    pool.name
                ))
            })?;
            if !names.insert(pool.name.as_str()) {
                return Err(Error::configuration(format!("duplicate pool '{}'", pool.name)));
            }
            if pool.gc_start_threshold > pool.gc_stop_threshold {
                return Err(Error::configuration(format!(
                    "pool '{}': gc_start_threshold {} above gc_stop_threshold {}",
                    pool.name, pool.gc_start_threshold, pool.gc_stop_threshold
                )));
            }
            if pool.gc_stop_threshold > 100 {
                return Err(Error::configuration(format!(
                    "pool '{}': gc_stop_threshold must be a percentage",
                    pool.name
                )));
            }
            for fs in &pool.filesystems {
                if let Some(free) = fs.free
                    && free > fs.capacity
                {
                    return Err(Error::configuration(format!(
                        "filesystem {}:{} has more free space than capacity",
                        fs.host,
                        fs.mount.display()
                    )));
                }
            }
        }
        for default in [&self.daemon.default_pool_in, &self.daemon.default_pool_out]
            .into_iter()
            .flatten()
        {
            if !names.contains(default.as_str()) {
                return Err(Error::configuration(format!(
                    "default pool '{default}' is not configured"
                )));
            }
        }
        if self.daemon.max_reqid < 2 {
            return Err(Error::configuration("max_reqid must be at least 2"));
        }
        Ok(())
    }

    /// Look up a file class by id
    #[must_use]
    pub fn file_class(&self, id: u32) -> Option<&FileClassConfig> {
        self.file_classes.iter().find(|fc| fc.id == id)
    }
}

/// Daemon settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Listen address for client connections
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory holding the persisted catalog
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Timeout for reading a request from a freshly accepted client
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Largest accepted request message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Descriptor budget shared by client connections and workers
    #[serde(default = "default_max_open_slots")]
    pub max_open_slots: usize,
    /// Interval between two sweeps of the wait queue
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Pool used for recalls that do not name one
    #[serde(default)]
    pub default_pool_in: Option<String>,
    /// Pool used for stage-out and alloc requests that do not name one
    #[serde(default)]
    pub default_pool_out: Option<String>,
    /// Request id wraparound point
    #[serde(default = "default_max_reqid")]
    pub max_reqid: u32,
    /// Bytes reserved for a file whose size the client did not give
    #[serde(default = "default_file_size")]
    pub default_file_size: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            read_timeout_secs: default_read_timeout_secs(),
            max_message_size: default_max_message_size(),
            max_open_slots: default_max_open_slots(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_pool_in: None,
            default_pool_out: None,
            max_reqid: default_max_reqid(),
            default_file_size: default_file_size(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5007".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tapestage")
}

const fn default_read_timeout_secs() -> u64 {
    60
}

const fn default_max_message_size() -> usize {
    1_000_000
}

const fn default_max_open_slots() -> usize {
    1000
}

const fn default_sweep_interval_secs() -> u64 {
    10
}

const fn default_max_reqid() -> u32 {
    crate::types::MAX_REQID
}

const fn default_file_size() -> u64 {
    200 * 1024 * 1024
}

/// Retention and space retry defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// How long an idle staged file stays on disk when its class does not say
    #[serde(default = "default_retention_secs")]
    pub default_retention_secs: u64,
    /// Delay before a written HSM file becomes eligible for migration
    #[serde(default)]
    pub default_migration_delay_secs: u64,
    /// Space retries before a parked request fails with ENOSPC
    #[serde(default = "default_max_space_retries")]
    pub max_space_retries: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            default_retention_secs: default_retention_secs(),
            default_migration_delay_secs: 0,
            max_space_retries: default_max_space_retries(),
        }
    }
}

const fn default_retention_secs() -> u64 {
    24 * 3600
}

const fn default_max_space_retries() -> u32 {
    5
}

/// Command line of an external worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandConfig {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Worker programs and dispatch limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Recalls and writes against tape targets
    #[serde(default = "default_mover")]
    pub tape: CommandConfig,
    /// Copies from external disk paths
    #[serde(default = "default_mover")]
    pub disk: CommandConfig,
    /// Native HSM recall and migration
    #[serde(default = "default_mover")]
    pub hsm: CommandConfig,
    /// Foreign HSM recall and migration
    #[serde(default = "default_mover")]
    pub foreign_hsm: CommandConfig,
    /// Space reclaim passes
    #[serde(default = "default_mover")]
    pub reclaim: CommandConfig,
    /// Dispatch attempts before a transient failure becomes permanent
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Kill workers that run longer than this; unset means no limit
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tape: default_mover(),
            disk: default_mover(),
            hsm: default_mover(),
            foreign_hsm: default_mover(),
            reclaim: default_mover(),
            max_retries: default_max_retries(),
            timeout_secs: None,
        }
    }
}

fn default_mover() -> CommandConfig {
    CommandConfig::new("tapestage-mover")
}

const fn default_max_retries() -> u32 {
    5
}

/// How a filesystem is chosen inside a pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Largest free space wins
    #[default]
    MostFree,
    /// Free space divided by the number of active streams of the same kind
    LeastStreams,
    /// Rotate over filesystems that fit
    RoundRobin,
}

/// One disk pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Free space percentage under which a reclaim pass starts
    #[serde(default = "default_gc_start")]
    pub gc_start_threshold: u8,
    /// Free space percentage a reclaim pass aims for
    #[serde(default = "default_gc_stop")]
    pub gc_stop_threshold: u8,
    /// Policy for recalls
    #[serde(default)]
    pub read_policy: SelectionPolicy,
    /// Policy for stage-out and alloc
    #[serde(default)]
    pub write_policy: SelectionPolicy,
    #[serde(default)]
    pub filesystems: Vec<FilesystemConfig>,
}

const fn default_gc_start() -> u8 {
    10
}

const fn default_gc_stop() -> u8 {
    15
}

/// One filesystem of a pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilesystemConfig {
    pub host: String,
    pub mount: PathBuf,
    /// Capacity in bytes
    pub capacity: u64,
    /// Free bytes at startup; defaults to the capacity
    #[serde(default)]
    pub free: Option<u64>,
}

/// Retention and migration policy of a file class
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileClassConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    /// Idle time after which a staged copy may be dropped
    #[serde(default)]
    pub retention_secs: Option<u64>,
    /// Delay between the end of a write and migration eligibility
    #[serde(default)]
    pub migration_delay_secs: Option<u64>,
}

/// Output format of the log subscriber
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [daemon]
        listen = "127.0.0.1:5007"
        default_pool_in = "default"

        [workers]
        max_retries = 3
        tape = { program = "/usr/bin/tpmover", args = ["--verbose"] }

        [[pools]]
        name = "default"
        read_policy = "least_streams"

        [[pools.filesystems]]
        host = "disk01"
        mount = "/srv/stage1"
        capacity = 1000000

        [[file_classes]]
        id = 7
        retention_secs = 3600
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.daemon.listen, "127.0.0.1:5007");
        assert_eq!(config.daemon.max_message_size, 1_000_000);
        assert_eq!(config.workers.max_retries, 3);
        assert_eq!(config.workers.tape.args, vec!["--verbose".to_string()]);
        assert_eq!(config.workers.disk.program, PathBuf::from("tapestage-mover"));
        assert_eq!(config.pools[0].read_policy, SelectionPolicy::LeastStreams);
        assert_eq!(config.pools[0].write_policy, SelectionPolicy::MostFree);
        assert_eq!(config.pools[0].gc_start_threshold, 10);
        assert_eq!(config.file_class(7).unwrap().retention_secs, Some(3600));
    }

    #[test]
    fn test_default_pool_must_exist() {
        let text = r#"
            [daemon]
            default_pool_out = "missing"
        "#;
        assert!(matches!(
            Config::from_toml_str(text),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_pool_rejected() {
        let text = r#"
            [[pools]]
            name = "a"
            [[pools]]
            name = "a"
        "#;
        assert!(Config::from_toml_str(text).is_err());
    }

    #[test]
    fn test_thresholds_validated() {
        let text = r#"
            [[pools]]
            name = "a"
            gc_start_threshold = 50
            gc_stop_threshold = 20
        "#;
        assert!(Config::from_toml_str(text).is_err());
    }
}
