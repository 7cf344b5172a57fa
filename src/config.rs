//! Configuration module for the echo server and client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::HandlerSettings;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tcp-echo")]
#[command(author = "tcp-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A thread-per-connection TCP echo server and client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the echo server
    Serve {
        /// Host to bind to (empty string = all interfaces)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Pending connection queue length
        #[arg(long)]
        backlog: Option<i32>,

        /// Idle read timeout per connection, in seconds
        #[arg(short = 't', long)]
        idle_timeout: Option<u64>,

        /// Maximum bytes read per call
        #[arg(long)]
        buffer_size: Option<usize>,
    },
    /// Send one message to a server and print the reply
    Send {
        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Maximum bytes read for the reply
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Message to send; prompted on stdin when omitted
        message: Option<String>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to, empty for all interfaces
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Idle read timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            backlog: default_backlog(),
            idle_timeout: default_idle_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl ServerConfig {
    /// Resolve the bind address. An empty host means every IPv4 interface.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        resolve_ipv4(host, self.port)
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            buffer_size: self.buffer_size,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout == 0 {
            return Err(ConfigError::Invalid("idle_timeout must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("server buffer_size must be greater than 0"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be greater than 0"));
        }
        Ok(())
    }
}

/// Client-related configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_client_host(),
            port: default_port(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl ClientConfig {
    pub fn target_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_ipv4(&self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("client buffer_size must be greater than 0"));
        }
        Ok(())
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

fn default_port() -> u16 {
    33333
}

fn default_backlog() -> i32 {
    5
}

fn default_idle_timeout() -> u64 {
    5 // 5 seconds
}

fn default_buffer_size() -> usize {
    1024
}

fn default_client_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::Resolve(format!("{host}:{port}"), e.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            ConfigError::Resolve(format!("{host}:{port}"), "no IPv4 address".to_string())
        })
}

/// What the process was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Send { message: Option<String> },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut server = toml_config.server;
        let mut client = toml_config.client;

        let mode = match cli.command {
            CliCommand::Serve {
                host,
                port,
                backlog,
                idle_timeout,
                buffer_size,
            } => {
                server.host = host.unwrap_or(server.host);
                server.port = port.unwrap_or(server.port);
                server.backlog = backlog.unwrap_or(server.backlog);
                server.idle_timeout = idle_timeout.unwrap_or(server.idle_timeout);
                server.buffer_size = buffer_size.unwrap_or(server.buffer_size);
                server.validate()?;
                Mode::Serve
            }
            CliCommand::Send {
                host,
                port,
                buffer_size,
                message,
            } => {
                client.host = host.unwrap_or(client.host);
                client.port = port.unwrap_or(client.port);
                client.buffer_size = buffer_size.unwrap_or(client.buffer_size);
                client.validate()?;
                Mode::Send { message }
            }
        };

        Ok(Config {
            mode,
            server,
            client,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Failed to resolve '{0}': {1}")]
    Resolve(String, String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
