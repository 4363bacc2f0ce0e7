//! Configuration module for graceful-drain.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_MSG_SIZE;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "graceful-drain")]
#[command(author = "graceful-drain authors")]
#[command(version = "0.1.0")]
#[command(about = "Echo server and client for graceful termination tests", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Server(ServerArgs),
    /// Run the echo client
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Port to listen on
    pub port: u16,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Number of connection workers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Read/write timeout per operation, in milliseconds
    #[arg(long)]
    pub io_timeout_ms: Option<u64>,

    /// Wait between shutdown notice and final message, in milliseconds
    #[arg(long)]
    pub grace_period_ms: Option<u64>,

    /// Payload size in bytes
    #[arg(long)]
    pub msg_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address (e.g., 127.0.0.1:8080)
    pub remote: String,

    /// What to do once the server shuts the connection down
    #[arg(long, value_enum)]
    pub on_shutdown: Option<OnShutdown>,

    /// Read/write timeout per operation, in milliseconds
    #[arg(long)]
    pub io_timeout_ms: Option<u64>,

    /// Connect attempts before giving up
    #[arg(long)]
    pub dial_attempts: Option<usize>,

    /// Payload size in bytes
    #[arg(long)]
    pub msg_size: Option<usize>,
}

/// Client behavior after the server ends a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnShutdown {
    /// Exit successfully.
    Exit,
    /// Dial again and start a new session.
    Reconnect,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_msg_size")]
    pub msg_size: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            msg_size: default_msg_size(),
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub resolve_retry_delay_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            workers: default_workers(),
            io_timeout_ms: default_io_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            backlog: default_backlog(),
            resolve_attempts: default_resolve_attempts(),
            resolve_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub dial_retry_delay_ms: u64,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub resolve_retry_delay_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_on_shutdown")]
    pub on_shutdown: OnShutdown,
    /// Stop after this many sessions in reconnect mode (unbounded if unset)
    pub max_sessions: Option<usize>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            dial_attempts: default_dial_attempts(),
            dial_retry_delay_ms: default_retry_delay_ms(),
            resolve_attempts: default_resolve_attempts(),
            resolve_retry_delay_ms: default_retry_delay_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            round_interval_ms: default_round_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            on_shutdown: default_on_shutdown(),
            max_sessions: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_msg_size() -> usize {
    DEFAULT_MSG_SIZE
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_io_timeout_ms() -> u64 {
    1000
}

fn default_grace_period_ms() -> u64 {
    15_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_resolve_attempts() -> usize {
    60
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_dial_attempts() -> usize {
    10
}

fn default_round_interval_ms() -> u64 {
    500
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000 // must outlast the server grace period
}

fn default_on_shutdown() -> OnShutdown {
    OnShutdown::Exit
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub msg_size: usize,
    pub io_timeout: Duration,
    pub grace_period: Duration,
    pub backlog: i32,
    pub resolve_attempts: usize,
    pub resolve_retry_delay: Duration,
}

impl ServerConfig {
    /// Address string to resolve before binding.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub remote: String,
    pub msg_size: usize,
    pub dial_attempts: usize,
    pub dial_retry_delay: Duration,
    pub resolve_attempts: usize,
    pub resolve_retry_delay: Duration,
    pub io_timeout: Duration,
    pub round_interval: Duration,
    pub shutdown_timeout: Duration,
    pub on_shutdown: OnShutdown,
    pub max_sessions: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub role: Role,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let role = match cli.command {
            Command::Server(args) => {
                let section = toml_config.server;
                Role::Server(ServerConfig {
                    host: args.host.unwrap_or(section.host),
                    port: args.port,
                    workers: args.workers.unwrap_or(section.workers),
                    msg_size: args.msg_size.unwrap_or(toml_config.protocol.msg_size),
                    io_timeout: millis(args.io_timeout_ms.unwrap_or(section.io_timeout_ms)),
                    grace_period: millis(args.grace_period_ms.unwrap_or(section.grace_period_ms)),
                    backlog: section.backlog,
                    resolve_attempts: section.resolve_attempts,
                    resolve_retry_delay: millis(section.resolve_retry_delay_ms),
                })
            }
            Command::Client(args) => {
                let section = toml_config.client;
                Role::Client(ClientConfig {
                    remote: args.remote,
                    msg_size: args.msg_size.unwrap_or(toml_config.protocol.msg_size),
                    dial_attempts: args.dial_attempts.unwrap_or(section.dial_attempts),
                    dial_retry_delay: millis(section.dial_retry_delay_ms),
                    resolve_attempts: section.resolve_attempts,
                    resolve_retry_delay: millis(section.resolve_retry_delay_ms),
                    io_timeout: millis(args.io_timeout_ms.unwrap_or(section.io_timeout_ms)),
                    round_interval: millis(section.round_interval_ms),
                    shutdown_timeout: millis(section.shutdown_timeout_ms),
                    on_shutdown: args.on_shutdown.unwrap_or(section.on_shutdown),
                    max_sessions: section.max_sessions,
                })
            }
        };

        let config = Config { log_level, role };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match &self.role {
            Role::Server(server) => {
                if server.workers == 0 {
                    return Err(ConfigError::Invalid("workers must be at least 1"));
                }
                if server.msg_size == 0 {
                    return Err(ConfigError::Invalid("msg_size must be at least 1"));
                }
                if server.io_timeout.is_zero() {
                    return Err(ConfigError::Invalid("io_timeout_ms must be positive"));
                }
                if server.resolve_attempts == 0 {
                    return Err(ConfigError::Invalid("resolve_attempts must be at least 1"));
                }
            }
            Role::Client(client) => {
                if client.msg_size == 0 {
                    return Err(ConfigError::Invalid("msg_size must be at least 1"));
                }
                if client.dial_attempts == 0 || client.resolve_attempts == 0 {
                    return Err(ConfigError::Invalid("retry attempts must be at least 1"));
                }
                if client.io_timeout.is_zero() || client.shutdown_timeout.is_zero() {
                    return Err(ConfigError::Invalid("timeouts must be positive"));
                }
            }
        }
        Ok(())
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
