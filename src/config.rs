//! Configuration module for the relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// I/O runtime used to drive the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Completion-based io_uring (Linux only)
    IoUring,
    /// Readiness-based mio (epoll on Linux, kqueue on macOS)
    Mio,
}

impl Default for RuntimeType {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            RuntimeType::IoUring
        } else {
            RuntimeType::Mio
        }
    }
}

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "yoctorelay")]
#[command(version)]
#[command(about = "Relays bytes from each connected peer to every other peer", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// I/O runtime
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// io_uring submission queue entries
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Maximum bytes read (and relayed) per chunk
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Maximum concurrent connections (0 = unbounded)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum in-flight writes per destination before it is dropped (0 = unbounded)
    #[arg(long)]
    pub max_pending_writes: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub uring: UringConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub runtime: RuntimeType,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: default_host(),
            runtime: RuntimeType::default(),
            backlog: default_backlog(),
        }
    }
}

/// io_uring configuration
#[derive(Debug, Deserialize)]
pub struct UringConfig {
    /// Submission queue entries
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            ring_size: default_ring_size(),
        }
    }
}

/// Relay behaviour
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub max_pending_writes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_connections: 0,
            max_pending_writes: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_ring_size() -> u32 {
    256
}

fn default_chunk_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub runtime: RuntimeType,
    pub backlog: i32,
    pub ring_size: u32,
    pub chunk_size: usize,
    pub max_connections: usize,
    pub max_pending_writes: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse()?;
        Self::from_cli(cli)
    }

    /// Resolve parsed CLI args against the optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = match cli.port.or(toml_config.server.port) {
            Some(0) => return Err(ConfigError::Invalid("port must be between 1 and 65535")),
            Some(port) => port,
            None => return Err(ConfigError::Invalid("a port number is required")),
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            ring_size: cli.ring_size.unwrap_or(toml_config.uring.ring_size),
            chunk_size: cli.chunk_size.unwrap_or(toml_config.relay.chunk_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.relay.max_connections),
            max_pending_writes: cli
                .max_pending_writes
                .unwrap_or(toml_config.relay.max_pending_writes),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        if config.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk size must be non-zero"));
        }
        if config.ring_size == 0 {
            return Err(ConfigError::Invalid("ring size must be non-zero"));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("{0}")]
    Invalid(&'static str),
}
