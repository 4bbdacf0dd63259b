//! Configuration module for mmap-httpd.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Idle connections are evicted after this many timeslots.
const IDLE_TIMESLOTS: u32 = 3;

/// Command-line arguments for the file server
#[derive(Parser, Debug)]
#[command(name = "mmap-httpd")]
#[command(author = "mmap-httpd authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-threaded static file HTTP/1.1 server", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0 or ::)
    #[arg(long)]
    pub host: Option<String>,

    /// Directory files are served from
    #[arg(short = 'r', long)]
    pub doc_root: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of queued tasks
    #[arg(short = 'q', long)]
    pub max_requests: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Idle-check interval in seconds (connections idle for three
    /// intervals are closed)
    #[arg(long)]
    pub timeslot: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_doc_root")]
    pub doc_root: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Readiness events handled per poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            doc_root: default_doc_root(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            max_events: default_max_events(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_requests: default_max_requests(),
        }
    }
}

/// Idle timer configuration
#[derive(Debug, Deserialize)]
pub struct TimerConfig {
    /// Tick interval in seconds
    #[serde(default = "default_timeslot")]
    pub timeslot: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            timeslot: default_timeslot(),
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

fn default_doc_root() -> PathBuf {
    PathBuf::from("./resources")
}

fn default_max_connections() -> usize {
    65535
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_events() -> usize {
    10000
}

fn default_workers() -> usize {
    8
}

fn default_max_requests() -> usize {
    10000
}

fn default_timeslot() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub doc_root: PathBuf,
    pub workers: usize,
    pub max_requests: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub max_events: usize,
    pub timeslot: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            doc_root: cli.doc_root.unwrap_or(toml_config.server.doc_root),
            workers: cli.workers.unwrap_or(toml_config.pool.workers),
            max_requests: cli.max_requests.unwrap_or(toml_config.pool.max_requests),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            max_events: toml_config.server.max_events,
            timeslot: Duration::from_secs(cli.timeslot.unwrap_or(toml_config.timer.timeslot)),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("workers", self.workers),
            ("max_requests", self.max_requests),
            ("max_connections", self.max_connections),
            ("max_events", self.max_events),
            ("timeslot", self.timeslot.as_secs() as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// How long a connection may stay idle before it is evicted.
    pub fn idle_timeout(&self) -> Duration {
        self.timeslot * IDLE_TIMESLOTS
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["mmap-httpd"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.doc_root, PathBuf::from("./resources"));
        assert_eq!(config.server.max_connections, 65535);
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.pool.max_requests, 10000);
        assert_eq!(config.timer.timeslot, 5);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            doc_root = "/srv/www"
            backlog = 64

            [pool]
            workers = 4

            [timer]
            timeslot = 2

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.doc_root, PathBuf::from("/srv/www"));
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.max_events, 10000);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.max_requests, 10000);
        assert_eq!(config.timer.timeslot, 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_port_is_required() {
        assert!(CliArgs::try_parse_from(["mmap-httpd"]).is_err());
        assert!(CliArgs::try_parse_from(["mmap-httpd", "http"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let config = parse(&["8080"]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.workers, 8);
        assert_eq!(config.idle_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nworkers = 4\nmax_requests = 100\n[timer]\ntimeslot = 1").unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&["9000", "-c", path, "-w", "2"]).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_requests, 100);
        assert_eq!(config.idle_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(matches!(parse(&["80", "-w", "0"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(parse(&["80", "-q", "0"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            parse(&["80", "--timeslot", "0"]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        assert!(matches!(
            parse(&["80", "-c", "/nonexistent/mmap-httpd.toml"]),
            Err(ConfigError::FileRead(..))
        ));
    }
}
