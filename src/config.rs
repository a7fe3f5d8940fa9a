//! Configuration module for the relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(author = "relay-core authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented request server with pluggable handlers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Total capacity of the hand-off queue
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Shared secret expected in `TOKEN:<secret>`
    #[arg(long)]
    pub token: Option<String>,

    /// Maximum requests accepted per rate-limit window
    #[arg(long)]
    pub rate_limit: Option<u64>,

    /// Directory the file handler reads from and writes to
    #[arg(long)]
    pub file_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Runtime configuration consumed by [`crate::runtime::Server`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Number of worker threads (0 = number of CPU cores)
    pub workers: usize,
    /// Total hand-off queue capacity, split evenly across worker shards
    pub queue_capacity: usize,
    /// Size of the per-read buffer; one read is one request
    pub read_buffer_size: usize,
    /// Maximum readiness events handled per poll
    pub max_events: usize,
    /// Upper bound on a single poll wait
    pub poll_timeout_ms: u64,
    /// Worker sleep when its shard is empty
    pub idle_sleep_us: u64,
    /// How long a worker keeps retrying a blocked response write
    pub write_timeout_ms: u64,
    /// Requests slower than this are logged as warnings
    pub slow_request_ms: u64,
    /// Connections beyond this are refused at accept
    pub max_connections: usize,
    /// Stats reporting period in seconds (0 = disabled)
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 0,
            queue_capacity: 50_000,
            read_buffer_size: 4096,
            max_events: 1024,
            poll_timeout_ms: 1,
            idle_sleep_us: 50,
            write_timeout_ms: 1000,
            slow_request_ms: 500,
            max_connections: 10_000,
            stats_interval_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Resolved number of workers.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn slow_request(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }
}

/// Authentication configuration
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token")]
    pub token: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

/// Input validation configuration
#[derive(Debug, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_commands")]
    pub commands: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            commands: default_commands(),
        }
    }
}

/// File handler configuration
#[derive(Debug, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_file_root")]
    pub root: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: default_file_root(),
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

fn default_token() -> String {
    "secret123".to_string()
}

fn default_max_requests() -> u64 {
    10_000
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_length() -> usize {
    1000
}

fn default_commands() -> Vec<String> {
    ["ECHO", "CAL", "READ", "WRITE"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_file_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub token: String,
    pub rate_limit: u64,
    pub rate_window: Duration,
    pub max_request_length: usize,
    pub commands: Vec<String>,
    pub file_root: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut server = toml_config.server;
        if let Some(host) = cli.host {
            server.host = host;
        }
        if let Some(port) = cli.port {
            server.port = port;
        }
        if let Some(workers) = cli.workers {
            server.workers = workers;
        }
        if let Some(capacity) = cli.queue_capacity {
            server.queue_capacity = capacity;
        }

        Ok(Config {
            server,
            token: cli.token.unwrap_or(toml_config.auth.token),
            rate_limit: cli
                .rate_limit
                .unwrap_or(toml_config.rate_limit.max_requests),
            rate_window: Duration::from_secs(toml_config.rate_limit.window_secs),
            max_request_length: toml_config.validation.max_length,
            commands: toml_config.validation.commands,
            file_root: cli.file_root.unwrap_or(toml_config.files.root),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
