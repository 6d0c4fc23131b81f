//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Connection registry settings.
    pub connections: ConnectionsConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Deadline for request/response exchanges, in seconds.
    pub request_timeout_secs: u64,
    /// Deadline for streaming handshakes, in seconds.
    pub stream_handshake_timeout_secs: u64,
    /// Confirmation window after a streaming handshake, in milliseconds.
    pub stream_confirm_delay_ms: u64,
    /// Upper bound on a latency probe, in seconds (capped at 5).
    pub probe_timeout_secs: u64,
    /// Address the path monitor checks routes against (`ip:port`).
    pub reachability_target: String,
    /// How often the path monitor re-checks, in seconds.
    pub reachability_interval_secs: u64,
    /// `User-Agent` sent with HTTP requests.
    pub user_agent: String,
}

/// Strategy used between reconnection attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReconnectStrategy {
    /// The same delay before every attempt.
    Flat,
    /// Exponentially growing delay with jitter.
    Exponential,
}

/// Connection registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Idle time after which a connected world is considered stale, in seconds.
    pub stale_threshold_secs: u64,
    /// Interval between activity sweeps (latency probes), in seconds.
    pub activity_sweep_secs: u64,
    /// Interval between staleness sweeps, in seconds.
    pub staleness_sweep_secs: u64,
    /// Delay before each reconnection attempt (initial delay for exponential), in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Reconnection delay strategy.
    pub reconnect_strategy: ReconnectStrategy,
    /// Upper bound on the exponential delay, in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Number of history entries kept.
    pub history_limit: usize,
    /// Key the history is stored under.
    pub history_key: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the console output.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            stream_handshake_timeout_secs: 15,
            stream_confirm_delay_ms: 2000,
            probe_timeout_secs: 5,
            reachability_target: "1.1.1.1:53".to_string(),
            reachability_interval_secs: 5,
            user_agent: "nebula-netmon".to_string(),
        }
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 300,
            activity_sweep_secs: 5,
            staleness_sweep_secs: 30,
            reconnect_delay_ms: 2000,
            reconnect_strategy: ReconnectStrategy::Flat,
            reconnect_max_delay_ms: 30_000,
            history_limit: 100,
            history_key: "connection_history".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

// --- Load / Save / Reload ---

/// Read, parse, and validate the config file at `path`.
fn read_validated(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
    let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default connection settings to {}", path.display());
            return Ok(config);
        }

        let config = read_validated(&path)?;
        log::info!("Loaded connection settings from {}", path.display());
        Ok(config)
    }

    /// Write `config.ron` into `config_dir`. The file is replaced atomically
    /// so a crash mid-write never leaves a truncated config behind.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .struct_names(false)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        let path = config_dir.join(CONFIG_FILE);
        let staging = path.with_extension("ron.tmp");
        std::fs::write(&staging, text).map_err(ConfigError::WriteError)?;
        std::fs::rename(&staging, &path).map_err(ConfigError::WriteError)
    }

    /// Re-read `config.ron`. Returns the new settings only when they differ
    /// from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_validated(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Connection settings changed on disk");
        Ok(Some(fresh))
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connections;
        if c.activity_sweep_secs == 0 || c.staleness_sweep_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep intervals must be at least one second".into(),
            ));
        }
        if c.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be positive".into()));
        }
        if c.history_key.is_empty() {
            return Err(ConfigError::Invalid("history_key must not be empty".into()));
        }
        if self.network.reachability_target.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "reachability_target '{}' is not an ip:port address",
                self.network.reachability_target
            )));
        }
        Ok(())
    }
}
