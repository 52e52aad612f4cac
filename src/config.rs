//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SWBRIDGE_PORT`, `SWBRIDGE_SERVER`,
//!    `SWBRIDGE_API_KEY`
//! 2. **Config file**: path via `--config <path>`, or `swbridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [device]
//! port = "/dev/ttyUSB0"     # omit to auto-detect
//! baud_rate = 115200
//! read_timeout_ms = 1000
//! command_timeout_ms = 5000
//!
//! [server]
//! addr = "127.0.0.1:8080"
//! verdict_timeout_secs = 30
//!
//! [api]
//! enabled = true
//! listen = "127.0.0.1:5000"
//! api_key = "optional-bearer-token"
//!
//! [monitor]
//! enabled = true
//! interval_secs = 2
//! max_failures = 5
//! status_refresh = false
//!
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff = 60
//! stable_threshold = 60
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "swbridge.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0} must be greater than zero")]
    Invalid(&'static str),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Serial link to the wallet.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device path. `None` scans for a USB serial adapter and waits for one.
    /// Override with `SWBRIDGE_PORT`.
    #[serde(default)]
    pub port: Option<String>,
    /// Line speed (default 115 200, the only rate the firmware uses).
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Upper bound for one blocking read in milliseconds (default 1000).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Deadline for a command's reply in milliseconds (default 5000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// Control server connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// `host:port` of the control server (default `127.0.0.1:8080`).
    /// Override with `SWBRIDGE_SERVER`.
    #[serde(default = "default_server_addr")]
    pub addr: String,
    /// Seconds to wait for each handshake verdict line (default 30).
    #[serde(default = "default_verdict_timeout_secs")]
    pub verdict_timeout_secs: u64,
}

/// Local HTTP API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the HTTP API (default true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Socket address to bind (default `127.0.0.1:5000`).
    #[serde(default = "default_api_listen")]
    pub listen: String,
    /// Optional Bearer token for every route except `/health`.
    /// Override with `SWBRIDGE_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Device liveness monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between checks (default 2).
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive failed checks before the device is declared lost (default 5).
    #[serde(default = "default_monitor_max_failures")]
    pub max_failures: u32,
    /// Send `GET_STATUS` after each successful check (default false).
    #[serde(default)]
    pub status_refresh: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `swbridge supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_true() -> bool {
    true
}
fn default_baud_rate() -> u32 {
    crate::device::serial::DEFAULT_BAUD
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_command_timeout_ms() -> u64 {
    crate::device::protocol::DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}
fn default_server_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_verdict_timeout_secs() -> u64 {
    crate::handshake::DEFAULT_VERDICT_TIMEOUT.as_secs()
}
fn default_api_listen() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_monitor_interval_secs() -> u64 {
    crate::monitor::DEFAULT_INTERVAL.as_secs()
}
fn default_monitor_max_failures() -> u32 {
    crate::monitor::DEFAULT_MAX_FAILURES
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            verdict_timeout_secs: default_verdict_timeout_secs(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn verdict_timeout(&self) -> Duration {
        Duration::from_secs(self.verdict_timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_api_listen(),
            api_key: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval_secs(),
            max_failures: default_monitor_max_failures(),
            status_refresh: false,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `swbridge.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the device loop or the monitor.
    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("device.baud_rate", u64::from(self.device.baud_rate)),
            ("device.read_timeout_ms", self.device.read_timeout_ms),
            ("device.command_timeout_ms", self.device.command_timeout_ms),
            ("server.verdict_timeout_secs", self.server.verdict_timeout_secs),
            ("monitor.interval_secs", self.monitor.interval_secs),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(*name)),
            None => Ok(()),
        }
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("SWBRIDGE_PORT").filter(|p| !p.is_empty()) {
            self.device.port = Some(port);
        }
        if let Some(addr) = var("SWBRIDGE_SERVER").filter(|a| !a.is_empty()) {
            self.server.addr = addr;
        }
        if let Some(key) = var("SWBRIDGE_API_KEY") {
            self.api.api_key = Some(key).filter(|k| !k.is_empty());
        }
    }
}
