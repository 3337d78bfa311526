//! Configuration resolution for drover.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/drover/drover.toml`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binaries, highest priority)
//!
//! Every layer is validated once at the end; invalid values fail fast with
//! [`Error::Config`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete drover configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Daemon-level settings: endpoints, worker program, logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Public listening endpoint shared by all workers.
    pub listen_addr: String,
    /// Unix socket serving the control interface.
    pub control_socket: PathBuf,
    /// Worker program and its arguments.
    pub worker_command: Vec<String>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            control_socket: default_control_socket(),
            worker_command: vec!["drover-fib-worker".to_string()],
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl DaemonConfig {
    /// Parse the listening address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            Error::Config(format!("invalid listen_addr {:?}: {e}", self.listen_addr))
        })
    }

    /// Validate daemon settings.
    pub fn validate(&self) -> Result<()> {
        self.listen_socket_addr()?;
        match self.worker_command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => return Err(Error::Config("worker_command must not be empty".into())),
        }
        if self.control_socket.as_os_str().is_empty() {
            return Err(Error::Config("control_socket must not be empty".into()));
        }
        Ok(())
    }
}

/// How the respawn delay grows with consecutive crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * n`
    Linear,
    /// `base * 2^(n-1)`
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "exponential" | "exp" => Ok(Self::Exponential),
            other => Err(Error::Config(format!(
                "unknown backoff strategy {other:?} (expected linear or exponential)"
            ))),
        }
    }
}

/// Pool settings. Immutable for the lifetime of a pool generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub desired_worker_count: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_restarts_per_window: u32,
    pub restart_window_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Connections held while no worker can take them.
    pub dispatch_queue_depth: usize,
    /// In-flight connections per worker before it is skipped (0 = unlimited).
    pub max_inflight_per_worker: usize,
    /// Exit records kept per slot.
    pub exit_history_len: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            desired_worker_count: num_cpus::get(),
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
            max_restarts_per_window: 5,
            restart_window_ms: 60_000,
            graceful_shutdown_timeout_ms: 10_000,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            dispatch_queue_depth: 128,
            max_inflight_per_worker: 0,
            exit_history_len: 16,
        }
    }
}

impl PoolConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub const fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub const fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub const fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Exit records kept per slot; never fewer than the crash-loop breaker
    /// needs to see a full window.
    pub fn history_capacity(&self) -> usize {
        let needed = usize::try_from(self.max_restarts_per_window)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        self.exit_history_len.max(needed)
    }

    /// Validate the pool settings.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be > 0".into()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::Config(format!(
                "heartbeat_timeout_ms ({}) must be greater than heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.restart_window_ms == 0 {
            return Err(Error::Config("restart_window_ms must be > 0".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(Error::Config(format!(
                "backoff_max_ms ({}) must be >= backoff_base_ms ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Validate all sections.
    pub fn validate(&self) -> Result<()> {
        self.daemon.validate()?;
        self.pool.validate()
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is the `--config` path; unlike the global file it must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = toml::Table::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_tables(&mut merged, read_table(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_tables(&mut merged, read_table(path)?);
    }

    let mut config: Config = toml::Value::Table(merged)
        .try_into()
        .map_err(|e: toml::de::Error| Error::Config(format!("invalid config: {e}")))?;

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("drover").join("drover.toml"))
}

/// Default control socket: `$XDG_RUNTIME_DIR/drover.sock`, falling back to
/// the temp dir.
pub fn default_control_socket() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("drover.sock")
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    content.parse::<toml::Table>().map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay `overlay` onto `base`, recursing into nested tables so a later
/// file only replaces the keys it actually sets.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `DROVER_*` environment variables.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Apply overrides from an arbitrary key lookup. Unparseable values are a
/// [`Error::Config`], never silently ignored.
pub fn apply_overrides_from<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let pool = &mut config.pool;
    if let Some(n) = parse_var(&lookup, "DROVER_WORKERS")? {
        pool.desired_worker_count = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_HEARTBEAT_INTERVAL_MS")? {
        pool.heartbeat_interval_ms = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_HEARTBEAT_TIMEOUT_MS")? {
        pool.heartbeat_timeout_ms = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_MAX_RESTARTS")? {
        pool.max_restarts_per_window = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_RESTART_WINDOW_MS")? {
        pool.restart_window_ms = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_SHUTDOWN_TIMEOUT_MS")? {
        pool.graceful_shutdown_timeout_ms = n;
    }
    if let Some(strategy) = parse_var(&lookup, "DROVER_BACKOFF")? {
        pool.backoff_strategy = strategy;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_BACKOFF_BASE_MS")? {
        pool.backoff_base_ms = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_BACKOFF_MAX_MS")? {
        pool.backoff_max_ms = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_QUEUE_DEPTH")? {
        pool.dispatch_queue_depth = n;
    }
    if let Some(n) = parse_var(&lookup, "DROVER_MAX_INFLIGHT")? {
        pool.max_inflight_per_worker = n;
    }

    let daemon = &mut config.daemon;
    if let Some(addr) = lookup("DROVER_LISTEN_ADDR") {
        daemon.listen_addr = addr;
    }
    if let Some(path) = lookup("DROVER_CONTROL_SOCKET") {
        daemon.control_socket = PathBuf::from(path);
    }
    if let Some(level) = lookup("DROVER_LOG_LEVEL") {
        daemon.log_level = level;
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}
