//! Configuration management for panmux.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::quality::DatabaseConfig;
use crate::selection::{SelectorKind, MAX_EXPLORE_SLOTS};
use crate::session::{HandshakeConfig, SessionConfig};
use crate::transport::TransportConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path selection and background rounds.
    #[serde(default)]
    pub session: SessionConfig,

    /// Multi-port establishment.
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Path quality database.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.path_count == 0 {
            return Err(Error::InvalidConfig("path_count must be at least 1".into()));
        }

        if session.disjoint_explore_slots > MAX_EXPLORE_SLOTS {
            return Err(Error::InvalidConfig(format!(
                "disjoint_explore_slots must be at most {MAX_EXPLORE_SLOTS}, got {}",
                session.disjoint_explore_slots
            )));
        }

        if session.event_capacity == 0 {
            return Err(Error::InvalidConfig("event_capacity must be at least 1".into()));
        }

        let intervals = [
            ("session.metrics_interval", session.metrics_interval),
            ("session.reselect_interval", session.reselect_interval),
            ("handshake.dial_read_timeout", self.handshake.dial_read_timeout),
            ("handshake.accept_timeout", self.handshake.accept_timeout),
            ("handshake.response_timeout", self.handshake.response_timeout),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
        }

        if self.handshake.dial_retries == 0 {
            return Err(Error::InvalidConfig("dial_retries must be at least 1".into()));
        }

        if self.handshake.port_stride == 0 {
            return Err(Error::InvalidConfig("port_stride must be non-zero".into()));
        }

        if self.database.max_samples == 0 {
            return Err(Error::InvalidConfig("max_samples must be at least 1".into()));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::InvalidConfig(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "panmux", "panmux").map_or_else(
            || PathBuf::from("panmux.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            session: SessionConfig {
                path_count: 3,
                selector: SelectorKind::Disjoint,
                disjoint_explore_slots: 1,
                reselect_interval: Duration::from_secs(10),
                ..Default::default()
            },
            handshake: HandshakeConfig {
                accept_timeout: Duration::from_secs(15),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
