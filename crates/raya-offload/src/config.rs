//! Runtime configuration
//!
//! All settings have defaults, so an empty TOML document is a valid config:
//!
//! ```toml
//! [scheduler]
//! workers = 4
//!
//! [io-pool]
//! threads = 2
//! shutdown = "drain"
//! queue = { kind = "bounded", capacity = 256 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of IO worker threads
pub const DEFAULT_IO_THREADS: usize = 2;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Config is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but holds an unusable value
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// What the IO pool queue does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Grow without bound (limited by memory)
    #[default]
    Unbounded,
    /// Hold at most `capacity` queued items; full enqueues block plain
    /// threads and fail on scheduler workers
    Bounded {
        /// Maximum number of queued items
        capacity: usize,
    },
}

/// What happens to queued-but-unstarted work at pool shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    /// Run every queued item before the pool threads exit
    #[default]
    Drain,
    /// Drop queued items unrun; their futures resolve to `Cancelled`
    Cancel,
}

/// IO worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of OS threads (0 = `DEFAULT_IO_THREADS`)
    pub threads: usize,
    /// Queue growth policy
    pub queue: QueuePolicy,
    /// Shutdown policy used when the pool is dropped
    pub shutdown: ShutdownPolicy,
    /// Thread name prefix; threads are named `{thread_name}-{index}`
    pub thread_name: String,
    /// Stack size for pool threads in bytes (None = platform default)
    pub stack_size: Option<usize>,
    /// Give up joining a stuck thread after this many milliseconds
    /// (None = wait forever)
    pub join_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_IO_THREADS,
            queue: QueuePolicy::Unbounded,
            shutdown: ShutdownPolicy::Drain,
            thread_name: "raya-io-worker".to_string(),
            stack_size: None,
            join_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    /// Pool config with `threads` threads and default everything else
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    /// Effective thread count
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 {
            DEFAULT_IO_THREADS
        } else {
            self.threads
        }
    }

    /// Join timeout as a duration
    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let QueuePolicy::Bounded { capacity: 0 } = self.queue {
            return Err(ConfigError::Invalid(
                "io-pool bounded queue capacity must be at least 1".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid(
                "io-pool thread-name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cooperative scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub workers: usize,
    /// Thread name prefix; threads are named `{thread_name}-{index}`
    pub thread_name: String,
    /// How long an idle worker parks before re-checking the queues
    pub idle_park_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            thread_name: "raya-worker".to_string(),
            idle_park_us: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Scheduler config with `workers` workers and default everything else
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Effective worker count
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Idle park interval as a duration
    pub fn idle_park(&self) -> Duration {
        Duration::from_micros(self.idle_park_us.max(1))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid(
                "scheduler thread-name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Full runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Cooperative scheduler settings
    pub scheduler: SchedulerConfig,
    /// IO worker pool settings
    pub io_pool: PoolConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML config
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Check values serde cannot check
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.io_pool.validate()
    }
}
