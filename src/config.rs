/*!
 * Configuration types for kvconnect
 *
 * Everything is read once when a connector is built. Files are TOML; every
 * field has a default so a minimal file only names what differs.
 */

use kvconnect_core_resilience::{CircuitBreakerConfig, PoolConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Default port of a directly addressed end-point
pub const DEFAULT_PORT: u16 = 6379;

/// Default port of a sentinel discovery end-point
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Listing commands get this multiple of the configured command timeout
pub const LISTING_TIMEOUT_FACTOR: u32 = 8;

const LISTING_COMMANDS: [&str; 5] = ["MGET", "MSET", "MSETNX", "SCAN", "KEYS"];

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// How the end-point is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// A single server
    #[default]
    Standalone,
    /// Master discovered through sentinels
    Sentinel,
    /// A list of cluster nodes
    Cluster,
}

impl ConnectionMode {
    /// Port used for host entries that do not name one
    pub fn default_port(&self) -> u16 {
        match self {
            ConnectionMode::Sentinel => DEFAULT_SENTINEL_PORT,
            ConnectionMode::Standalone | ConnectionMode::Cluster => DEFAULT_PORT,
        }
    }
}

/// Main connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub mode: ConnectionMode,

    /// Comma-separated `host[:port]` entries
    #[serde(default)]
    pub hosts: String,

    /// Master name to resolve through the sentinels
    #[serde(default)]
    pub sentinel_master_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Database index selected after connect
    #[serde(default)]
    pub database: u32,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default)]
    pub starttls: bool,

    #[serde(default = "default_true")]
    pub verify_peer: bool,

    /// Client name announced to the server (suffixed with the crate version)
    #[serde(default)]
    pub client_name: Option<String>,

    /// Command timeout; negative values are treated as zero (no timeout)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_millis: i64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_millis: u64,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[pool]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_total: usize,
    pub max_idle: usize,
    pub min_idle: usize,
    /// Borrow wait before failing with pool exhaustion
    pub max_wait_seconds: u64,
    /// Idle time after which a connection may be evicted (0 disables)
    pub min_idle_seconds: u64,
    /// Interval between evictor runs (0 disables)
    pub cleaner_run_seconds: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait_seconds: 10,
            min_idle_seconds: 60,
            cleaner_run_seconds: 30,
        }
    }
}

/// `[circuit_breaker]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    /// Executions the failure ratio is measured over (0 means "same as threshold")
    pub failure_executions: u32,
    pub success_threshold: u32,
    /// Executions the success ratio is measured over (0 means "same as threshold")
    pub success_executions: u32,
    /// Dwell time in the open state
    pub delay_millis: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            failure_executions: 5,
            success_threshold: 2,
            success_executions: 2,
            delay_millis: 60_000,
        }
    }
}

/// `[probe]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Backoff base; attempt `n` waits `n * base` plus up to `base` of jitter
    pub base_delay_millis: u64,
    /// Command timeout of the probe ping
    pub timeout_millis: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            base_delay_millis: 1000,
            timeout_millis: 1000,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Write JSON logs to this file instead of compact text to stdout
    pub file: Option<PathBuf>,
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_command_timeout() -> i64 {
    5000
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            hosts: String::new(),
            sentinel_master_id: None,
            username: None,
            password: None,
            database: 0,
            ssl: false,
            starttls: false,
            verify_peer: true,
            client_name: None,
            command_timeout_millis: default_command_timeout(),
            connect_timeout_millis: default_connect_timeout(),
            pool: PoolSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            probe: ProbeSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ConnectorConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Semantic checks serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_total == 0 {
            return Err(ConfigError::Invalid("pool.max_total must be positive".into()));
        }
        if pool.max_idle > pool.max_total {
            return Err(ConfigError::Invalid(format!(
                "pool.max_idle ({}) exceeds pool.max_total ({})",
                pool.max_idle, pool.max_total
            )));
        }
        if pool.min_idle > pool.max_idle {
            return Err(ConfigError::Invalid(format!(
                "pool.min_idle ({}) exceeds pool.max_idle ({})",
                pool.min_idle, pool.max_idle
            )));
        }

        let breaker = &self.circuit_breaker;
        if breaker.enabled && (breaker.failure_threshold == 0 || breaker.success_threshold == 0) {
            return Err(ConfigError::Invalid(
                "circuit_breaker thresholds must be positive".into(),
            ));
        }

        if self.mode == ConnectionMode::Sentinel
            && self
                .sentinel_master_id
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(ConfigError::Invalid(
                "sentinel mode requires sentinel_master_id".into(),
            ));
        }

        if self.probe.base_delay_millis == 0 {
            return Err(ConfigError::Invalid("probe.base_delay_millis must be positive".into()));
        }

        Ok(())
    }

    /// Command timeout, clamped at zero
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_millis.max(0) as u64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    /// Pool settings for the resilience pool
    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.pool;
        PoolConfig {
            max_total: pool.max_total,
            max_idle: pool.max_idle,
            min_idle: pool.min_idle,
            max_wait: Duration::from_secs(pool.max_wait_seconds),
            min_evictable_idle: non_zero_secs(pool.min_idle_seconds),
            eviction_interval: non_zero_secs(pool.cleaner_run_seconds),
            max_lifetime: None,
        }
    }

    /// Ratio thresholds for the breaker, or `None` when it is disabled
    pub fn circuit_breaker_config(&self) -> Option<CircuitBreakerConfig> {
        let breaker = &self.circuit_breaker;
        if !breaker.enabled {
            return None;
        }
        Some(CircuitBreakerConfig::from_counts(
            breaker.failure_threshold,
            breaker.failure_executions,
            breaker.success_threshold,
            breaker.success_executions,
            Duration::from_millis(breaker.delay_millis),
        ))
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Timeout for one command given the connection's configured timeout.
///
/// Listing commands scan many keys and get [`LISTING_TIMEOUT_FACTOR`] times
/// the base.
pub fn timeout_for_command(base: Duration, command: &str) -> Duration {
    if LISTING_COMMANDS
        .iter()
        .any(|listing| listing.eq_ignore_ascii_case(command))
    {
        base * LISTING_TIMEOUT_FACTOR
    } else {
        base
    }
}

/// Holder for a lazily loaded configuration file.
///
/// Concurrent first callers of [`load`](Self::load) share one read of the
/// file. [`reset`](Self::reset) drops the cached value so the next `load`
/// reads the file again.
pub struct ConfigStore {
    path: PathBuf,
    cell: RwLock<Arc<OnceCell<Arc<ConnectorConfig>>>>,
    loads: AtomicUsize,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: RwLock::new(Arc::new(OnceCell::new())),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the configuration, reading the file at most once
    /// until the next reset
    pub async fn load(&self) -> Result<Arc<ConnectorConfig>, ConfigError> {
        let cell = Arc::clone(&self.cell.read());
        let config = cell
            .get_or_try_init(|| async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                let text = tokio::fs::read_to_string(&self.path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: self.path.clone(),
                        source,
                    })?;
                let config = ConnectorConfig::from_toml_str(&text)?;
                config.validate()?;
                info!(path = %self.path.display(), "Loaded connector configuration");
                Ok::<_, ConfigError>(Arc::new(config))
            })
            .await?;
        Ok(Arc::clone(config))
    }

    /// Forget the loaded configuration
    pub fn reset(&self) {
        *self.cell.write() = Arc::new(OnceCell::new());
        debug!(path = %self.path.display(), "Connector configuration reset");
    }

    /// Number of times the file has been read
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}
