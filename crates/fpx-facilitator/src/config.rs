//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::guard::GuardConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub relay_file: PathBuf,
    /// Seconds between relay file reloads; 0 disables reloading.
    pub relay_reload_interval_secs: u64,
    /// Times a client is handed out before it is dropped; 0 means unbounded.
    pub client_max_serve: u32,
    /// Poll interval advertised to proxies.
    pub check_back_in_secs: u64,
    pub connection_timeout_ms: u64,
    pub max_line_length: usize,
    /// Log client and proxy addresses instead of scrubbing them.
    pub unsafe_logging: bool,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9002)),
            relay_file: PathBuf::from("relays"),
            relay_reload_interval_secs: 300,
            client_max_serve: 10,
            check_back_in_secs: 10,
            connection_timeout_ms: 1000,
            max_line_length: 10 * 1024,
            unsafe_logging: false,
            metrics_addr: None,
        }
    }
}

fn invalid(field: &str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid(format!("Invalid {}: {}", field, err))
}

impl ServerConfig {
    /// Load configuration from environment variables, command line, and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::load_with(&args)
    }

    /// Layered load: defaults, then `FPX_*` environment variables, then
    /// `args`, then the TOML file named by `--config` or `FPX_CONFIG`.
    pub fn load_with(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.load_from_env()?;
        let config_path = config.load_from_args(args)?;

        if let Some(path) = config_path.or_else(|| std::env::var("FPX_CONFIG").ok().map(PathBuf::from)) {
            let content = std::fs::read_to_string(&path)?;
            config.apply_toml(&content)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn load_from_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply `FPX_*` variables as returned by `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(addr) = var("FPX_LISTEN_ADDR") {
            self.listen_addr = addr.parse().map_err(|e| invalid("listen_addr", e))?;
        }

        if let Some(path) = var("FPX_RELAY_FILE") {
            self.relay_file = PathBuf::from(path);
        }

        if let Some(secs) = var("FPX_RELAY_RELOAD_INTERVAL_SECS") {
            self.relay_reload_interval_secs = secs.parse().map_err(|e| invalid("relay_reload_interval_secs", e))?;
        }

        if let Some(max) = var("FPX_CLIENT_MAX_SERVE") {
            self.client_max_serve = max.parse().map_err(|e| invalid("client_max_serve", e))?;
        }

        if let Some(secs) = var("FPX_CHECK_BACK_IN_SECS") {
            self.check_back_in_secs = secs.parse().map_err(|e| invalid("check_back_in_secs", e))?;
        }

        if let Some(ms) = var("FPX_CONNECTION_TIMEOUT_MS") {
            self.connection_timeout_ms = ms.parse().map_err(|e| invalid("connection_timeout_ms", e))?;
        }

        if let Some(len) = var("FPX_MAX_LINE_LENGTH") {
            self.max_line_length = len.parse().map_err(|e| invalid("max_line_length", e))?;
        }

        if let Some(addr) = var("FPX_METRICS_ADDR") {
            self.metrics_addr = Some(addr.parse().map_err(|e| invalid("metrics_addr", e))?);
        }

        if let Some(enabled) = var("FPX_UNSAFE_LOGGING") {
            self.unsafe_logging = enabled.parse().map_err(|e| invalid("unsafe_logging", e))?;
        }

        Ok(())
    }

    /// Apply command line flags. Returns the `--config` path, if given.
    fn load_from_args(&mut self, args: &[String]) -> Result<Option<PathBuf>, ConfigError> {
        let mut config_path = None;
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            let flag = arg.as_str();
            let mut value = |flag: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| ConfigError::Invalid(format!("{} requires a value", flag)))
            };

            match flag {
                "--listen-addr" | "-l" => {
                    self.listen_addr = value(flag)?.parse().map_err(|e| invalid("listen_addr", e))?;
                }
                "--relay-file" | "-r" => {
                    self.relay_file = PathBuf::from(value(flag)?);
                }
                "--reload-interval" => {
                    self.relay_reload_interval_secs = value(flag)?.parse().map_err(|e| invalid("relay_reload_interval_secs", e))?;
                }
                "--timeout-ms" => {
                    self.connection_timeout_ms = value(flag)?.parse().map_err(|e| invalid("connection_timeout_ms", e))?;
                }
                "--max-line-length" => {
                    self.max_line_length = value(flag)?.parse().map_err(|e| invalid("max_line_length", e))?;
                }
                "--max-serve" => {
                    self.client_max_serve = value(flag)?.parse().map_err(|e| invalid("client_max_serve", e))?;
                }
                "--metrics-addr" => {
                    self.metrics_addr = Some(value(flag)?.parse().map_err(|e| invalid("metrics_addr", e))?);
                }
                "--config" | "-f" => {
                    config_path = Some(PathBuf::from(value(flag)?));
                }
                "--unsafe-logging" => {
                    self.unsafe_logging = true;
                }
                other => {
                    return Err(ConfigError::Invalid(format!("Unknown argument: {}", other)));
                }
            }
        }

        Ok(config_path)
    }

    /// Override fields present in a TOML document.
    pub fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let toml_config: toml::Value = toml::from_str(content)?;

        if let Some(addr) = toml_config.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = addr.parse().map_err(|e| invalid("listen_addr in TOML", e))?;
        }

        if let Some(path) = toml_config.get("relay_file").and_then(|v| v.as_str()) {
            self.relay_file = PathBuf::from(path);
        }

        if let Some(secs) = toml_config.get("relay_reload_interval_secs").and_then(|v| v.as_integer()) {
            self.relay_reload_interval_secs = u64::try_from(secs).map_err(|e| invalid("relay_reload_interval_secs", e))?;
        }

        if let Some(max) = toml_config.get("client_max_serve").and_then(|v| v.as_integer()) {
            self.client_max_serve = u32::try_from(max).map_err(|e| invalid("client_max_serve", e))?;
        }

        if let Some(secs) = toml_config.get("check_back_in_secs").and_then(|v| v.as_integer()) {
            self.check_back_in_secs = u64::try_from(secs).map_err(|e| invalid("check_back_in_secs", e))?;
        }

        if let Some(ms) = toml_config.get("connection_timeout_ms").and_then(|v| v.as_integer()) {
            self.connection_timeout_ms = u64::try_from(ms).map_err(|e| invalid("connection_timeout_ms", e))?;
        }

        if let Some(len) = toml_config.get("max_line_length").and_then(|v| v.as_integer()) {
            self.max_line_length = usize::try_from(len).map_err(|e| invalid("max_line_length", e))?;
        }

        if let Some(enabled) = toml_config.get("unsafe_logging").and_then(|v| v.as_bool()) {
            self.unsafe_logging = enabled;
        }

        if let Some(addr) = toml_config.get("metrics_addr").and_then(|v| v.as_str()) {
            self.metrics_addr = Some(addr.parse().map_err(|e| invalid("metrics_addr in TOML", e))?);
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connection_timeout_ms must be > 0".to_string()));
        }

        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid("max_line_length must be > 0".to_string()));
        }

        if self.check_back_in_secs == 0 {
            return Err(ConfigError::Invalid("check_back_in_secs must be > 0".to_string()));
        }

        if !self.relay_file.exists() {
            return Err(ConfigError::Invalid(format!(
                "Relay file not found: {:?}",
                self.relay_file
            )));
        }

        Ok(())
    }

    pub fn client_max_serve(&self) -> Option<u32> {
        (self.client_max_serve > 0).then_some(self.client_max_serve)
    }

    pub fn relay_reload_interval(&self) -> Option<Duration> {
        (self.relay_reload_interval_secs > 0).then(|| Duration::from_secs(self.relay_reload_interval_secs))
    }

    pub fn check_back_in(&self) -> Duration {
        Duration::from_secs(self.check_back_in_secs)
    }

    pub fn to_guard_config(&self) -> GuardConfig {
        GuardConfig {
            timeout: Duration::from_millis(self.connection_timeout_ms),
            max_line_length: self.max_line_length,
        }
    }
}
