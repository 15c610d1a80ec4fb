//! Configuration module for lifeline.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. Everything is
//! resolved once at startup into immutable values.

use crate::client::ServerList;
use crate::connection::ConnectionConfig;
use crate::heartbeat::HeartbeatConfig;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "lifeline")]
#[command(author = "lifeline authors")]
#[command(version = "0.1.0")]
#[command(about = "Line echo server and reconnecting client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Serve {
        /// Address to bind to (e.g., 0.0.0.0:9000)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Admin endpoint address (e.g., 0.0.0.0:9001)
        #[arg(long)]
        admin: Option<String>,

        /// Maximum concurrent connections
        #[arg(short = 'm', long = "max-conn")]
        max_connections: Option<usize>,
    },
    /// Run the reconnecting client
    Connect {
        /// Server to connect to; repeat for a list to balance across
        #[arg(short = 's', long = "server")]
        servers: Vec<String>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_server_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_server_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_conn_age_secs")]
    pub max_conn_age_secs: u64,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            max_connections: default_max_connections(),
            read_timeout_ms: default_server_read_timeout_ms(),
            write_timeout_ms: default_server_write_timeout_ms(),
            max_conn_age_secs: default_max_conn_age_secs(),
            workers: None,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_client_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_client_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_write_timeout_ms")]
    pub heartbeat_write_timeout_ms: u64,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Runtime worker threads for the client process
    pub workers: Option<usize>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_client_read_timeout_ms(),
            write_timeout_ms: default_client_write_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_write_timeout_ms: default_heartbeat_write_timeout_ms(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            workers: None,
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

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_server_read_timeout_ms() -> u64 {
    60_000
}

fn default_server_write_timeout_ms() -> u64 {
    5_000
}

fn default_max_conn_age_secs() -> u64 {
    60 * 60 // 1 hour
}

fn default_servers() -> Vec<String> {
    vec!["localhost:9000".to_string()]
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

// Longer than the server's idle timeout so the server always gives up first
fn default_client_read_timeout_ms() -> u64 {
    65_000
}

fn default_client_write_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_write_timeout_ms() -> u64 {
    2_000
}

fn default_backoff_min_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    3_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    /// `None` disables the admin endpoint.
    pub admin_listen: Option<String>,
    pub max_connections: usize,
    pub connection: ConnectionConfig,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub servers: ServerList,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    /// Backoff is drawn from `[backoff_min, backoff_max)`.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Serve(ServerConfig),
    Connect(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over the TOML config and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = cli.log_level.unwrap_or(toml_config.logging.level);

        let (mode, section_workers) = match cli.command {
            Command::Serve {
                listen,
                admin,
                max_connections,
            } => {
                let server = toml_config.server;
                let config = ServerConfig {
                    listen: listen.unwrap_or(server.listen),
                    admin_listen: Some(admin.unwrap_or(server.admin_listen))
                        .filter(|addr| !addr.is_empty()),
                    max_connections: max_connections.unwrap_or(server.max_connections),
                    connection: ConnectionConfig {
                        read_timeout: Duration::from_millis(server.read_timeout_ms),
                        write_timeout: Duration::from_millis(server.write_timeout_ms),
                        max_conn_age: Duration::from_secs(server.max_conn_age_secs),
                    },
                };
                validate_server(&config)?;
                (Mode::Serve(config), server.workers)
            }
            Command::Connect { servers } => {
                let client = toml_config.client;
                let targets = if servers.is_empty() {
                    client.servers
                } else {
                    servers
                };
                let config = ClientConfig {
                    servers: ServerList::new(targets)
                        .ok_or_else(|| ConfigError::Invalid("server list is empty".into()))?,
                    connect_timeout: Duration::from_millis(client.connect_timeout_ms),
                    read_timeout: Duration::from_millis(client.read_timeout_ms),
                    write_timeout: Duration::from_millis(client.write_timeout_ms),
                    heartbeat: HeartbeatConfig {
                        interval: Duration::from_millis(client.heartbeat_interval_ms),
                        write_timeout: Duration::from_millis(client.heartbeat_write_timeout_ms),
                    },
                    backoff_min: Duration::from_millis(client.backoff_min_ms),
                    backoff_max: Duration::from_millis(client.backoff_max_ms),
                };
                validate_client(&config)?;
                (Mode::Connect(config), client.workers)
            }
        };

        Ok(Config {
            mode,
            workers: cli.workers.or(section_workers),
            log_level,
        })
    }
}

fn require_nonzero(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

fn validate_server(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.max_connections == 0 {
        return Err(ConfigError::Invalid(
            "max_connections must be greater than zero".into(),
        ));
    }
    require_nonzero("read_timeout_ms", config.connection.read_timeout)?;
    require_nonzero("write_timeout_ms", config.connection.write_timeout)?;
    require_nonzero("max_conn_age_secs", config.connection.max_conn_age)?;
    Ok(())
}

fn validate_client(config: &ClientConfig) -> Result<(), ConfigError> {
    require_nonzero("connect_timeout_ms", config.connect_timeout)?;
    require_nonzero("read_timeout_ms", config.read_timeout)?;
    require_nonzero("write_timeout_ms", config.write_timeout)?;
    require_nonzero("heartbeat_interval_ms", config.heartbeat.interval)?;
    require_nonzero("heartbeat_write_timeout_ms", config.heartbeat.write_timeout)?;
    if config.backoff_min >= config.backoff_max {
        return Err(ConfigError::Invalid(
            "backoff_min_ms must be less than backoff_max_ms".into(),
        ));
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
