//! Configuration module for modhost.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::{ModhostError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/modhost.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/modhost.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Module engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    /// Upper bound for a single listen call, in seconds.
    #[serde(default = "default_max_listen_timeout")]
    pub max_listen_timeout_secs: u64,
    /// How long a waiter may outlive its deadline before decay removes it.
    #[serde(default = "default_listen_grace_period")]
    pub listen_grace_period_secs: u64,
    /// Interval of the background decay sweep, in seconds.
    #[serde(default = "default_decay_interval")]
    pub decay_interval_secs: u64,
    /// Whether receiver id 0 is delivered to every requester.
    #[serde(default = "default_broadcast_enabled")]
    pub broadcast_enabled: bool,
    /// Maximum Lua instructions per command (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Maximum memory per module VM in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
    /// Maximum wall-clock time per command in seconds (0 = unlimited).
    #[serde(default = "default_max_execution_seconds")]
    pub max_execution_seconds: u32,
}

fn default_max_listen_timeout() -> u64 {
    300
}

fn default_listen_grace_period() -> u64 {
    10
}

fn default_decay_interval() -> u64 {
    30
}

fn default_broadcast_enabled() -> bool {
    true
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_memory_mb() -> usize {
    10
}

fn default_max_execution_seconds() -> u32 {
    30
}

impl ModulesConfig {
    /// Upper bound for a single listen call.
    pub fn max_listen_timeout(&self) -> Duration {
        Duration::from_secs(self.max_listen_timeout_secs)
    }

    /// Grace period granted to waiters past their deadline.
    pub fn listen_grace_period(&self) -> Duration {
        Duration::from_secs(self.listen_grace_period_secs)
    }

    /// Interval of the background decay sweep.
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            max_listen_timeout_secs: default_max_listen_timeout(),
            listen_grace_period_secs: default_listen_grace_period(),
            decay_interval_secs: default_decay_interval(),
            broadcast_enabled: default_broadcast_enabled(),
            max_instructions: default_max_instructions(),
            max_memory_mb: default_max_memory_mb(),
            max_execution_seconds: default_max_execution_seconds(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Module engine configuration.
    #[serde(default)]
    pub modules: ModulesConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Environment overrides are applied and the result is validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ModhostError::Validation(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides.
    ///
    /// - `MODHOST_DATABASE_PATH` overrides `database.path`
    /// - `MODHOST_LOG_LEVEL` overrides `logging.level`
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("MODHOST_DATABASE_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(level) = std::env::var("MODHOST_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(ModhostError::Config(
                "database.path must not be empty".to_string(),
            ));
        }
        if self.modules.max_listen_timeout_secs == 0 {
            return Err(ModhostError::Config(
                "modules.max_listen_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.modules.decay_interval_secs == 0 {
            return Err(ModhostError::Config(
                "modules.decay_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
