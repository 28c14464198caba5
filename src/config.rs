//! Configuration module for iobench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over the built-in defaults.

use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{IoOp, HEADER_SIZE};

/// Command-line arguments.
///
/// Without server addresses the process runs as a server, otherwise as a
/// client connecting to every listed server.
#[derive(Parser, Debug)]
#[command(name = "iobench")]
#[command(version = "0.1.0")]
#[command(about = "Client/server I/O micro-benchmark", long_about = None)]
pub struct CliArgs {
    /// Server addresses as host or host:port
    #[arg(value_name = "SERVER")]
    pub servers: Vec<String>,

    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TCP port number to use
    #[arg(short = 'p')]
    pub port: Option<u16>,

    /// Timeout for connecting to the peer (or "inf")
    #[arg(short = 'n', value_name = "TIME")]
    pub connect_timeout: Option<String>,

    /// Comma-separated IO operations [read|write]
    #[arg(short = 'o', value_name = "OPS")]
    pub operations: Option<String>,

    /// Data size range <min>:<max> of the IO payload
    #[arg(short = 'd', value_name = "SIZE")]
    pub data_size: Option<String>,

    /// Number of off-cache IO buffers
    #[arg(short = 'b')]
    pub offcache_buffers: Option<usize>,

    /// Number of iterations to run (0 for unlimited)
    #[arg(short = 'i')]
    pub iterations: Option<u64>,

    /// Number of outstanding requests
    #[arg(short = 'w')]
    pub window: Option<usize>,

    /// Number of outstanding requests per connection
    #[arg(short = 'a')]
    pub conn_window: Option<usize>,

    /// Split data transfers to chunks of this size
    #[arg(short = 'k')]
    pub chunk_size: Option<usize>,

    /// Size of the IO request message
    #[arg(short = 'r')]
    pub iomsg_size: Option<usize>,

    /// Client timeout waiting for replies (or "inf")
    #[arg(short = 't', value_name = "TIME")]
    pub client_timeout: Option<String>,

    /// Number of connection retries on the client, or listen retries on
    /// the server (or "inf")
    #[arg(short = 'c')]
    pub retries: Option<String>,

    /// Interval between connection retries
    #[arg(short = 'y', value_name = "TIME")]
    pub retry_interval: Option<String>,

    /// Time limit to run the client (or "inf")
    #[arg(short = 'l', value_name = "TIME")]
    pub runtime_limit: Option<String>,

    /// Random seed
    #[arg(short = 's')]
    pub seed: Option<u32>,

    /// Verbose logging
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Validate IO data
    #[arg(short = 'q')]
    pub validate: bool,

    /// Do not disconnect connections on reply timeout
    #[arg(short = 'D')]
    pub debug_timeout: bool,

    /// Interval between performance reports
    #[arg(short = 'P', value_name = "TIME")]
    pub print_interval: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// A TOML value that may be written as a number or a string.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum Scalar {
    Int(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub port: Option<u16>,
    pub connect_timeout: Option<Scalar>,
    pub retries: Option<Scalar>,
    pub retry_interval: Option<Scalar>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    pub iomsg_size: Option<usize>,
    pub data_size: Option<Scalar>,
    pub chunk_size: Option<usize>,
    pub offcache_buffers: Option<usize>,
    pub iterations: Option<u64>,
    pub window: Option<usize>,
    pub conn_window: Option<usize>,
    pub operations: Option<Vec<String>>,
    pub seed: Option<u32>,
    pub validate: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub servers: Option<Vec<String>>,
    pub timeout: Option<Scalar>,
    pub runtime_limit: Option<Scalar>,
    pub print_interval: Option<Scalar>,
    pub debug_timeout: Option<bool>,
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Resolved server addresses. Empty means server role.
    pub servers: Vec<SocketAddr>,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Connect retries on the client, listen retries on the server.
    /// `u64::MAX` means unlimited.
    pub retries: u64,
    pub retry_interval: Duration,
    pub client_timeout: Duration,
    pub runtime_limit: Duration,
    pub print_interval: Duration,
    pub debug_timeout: bool,
    pub iomsg_size: usize,
    pub min_data_size: usize,
    pub max_data_size: usize,
    pub chunk_size: usize,
    pub offcache_buffers: usize,
    /// `u64::MAX` means unlimited.
    pub iterations: u64,
    pub window: usize,
    pub conn_window: usize,
    pub operations: Vec<IoOp>,
    pub seed: u32,
    pub validate: bool,
    pub verbose: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: 1337,
            connect_timeout: Duration::from_secs(20),
            retries: u64::MAX,
            retry_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(50),
            runtime_limit: Duration::MAX,
            print_interval: Duration::from_secs(1),
            debug_timeout: false,
            iomsg_size: 256,
            min_data_size: 4096,
            max_data_size: 4096,
            chunk_size: u32::MAX as usize,
            offcache_buffers: 0,
            iterations: 1000,
            window: 1,
            conn_window: 1,
            operations: vec![IoOp::Write],
            seed: default_seed(),
            validate: false,
            verbose: false,
            log_level: default_log_level(),
        }
    }
}

fn default_seed() -> u32 {
    (chrono::Utc::now().timestamp() as u32) ^ std::process::id()
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

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values over defaults, then validate.
    pub fn resolve(cli: CliArgs, mut toml: TomlConfig) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let mut servers = toml.client.servers.take().unwrap_or_default();

        // Config file
        let net = toml.network;
        if let Some(port) = net.port {
            config.port = port;
        }
        if let Some(v) = net.connect_timeout {
            config.connect_timeout = parse_time("connect timeout", &v.to_string())?;
        }
        if let Some(v) = net.retries {
            config.retries = parse_retries(&v.to_string())?;
        }
        if let Some(v) = net.retry_interval {
            config.retry_interval = parse_time("retry interval", &v.to_string())?;
        }

        let work = toml.workload;
        if let Some(v) = work.iomsg_size {
            config.iomsg_size = v;
        }
        if let Some(v) = work.data_size {
            config.set_data_size(&v.to_string())?;
        }
        if let Some(v) = work.chunk_size {
            config.chunk_size = v;
        }
        if let Some(v) = work.offcache_buffers {
            config.offcache_buffers = v;
        }
        if let Some(v) = work.iterations {
            config.iterations = v;
        }
        if let Some(v) = work.window {
            config.window = v;
        }
        if let Some(v) = work.conn_window {
            config.conn_window = v;
        }
        if let Some(v) = work.operations {
            config.operations = parse_operations(&v.join(","))?;
        }
        if let Some(v) = work.seed {
            config.seed = v;
        }
        config.validate = work.validate.unwrap_or(false);

        let client = toml.client;
        if let Some(v) = client.timeout {
            config.client_timeout = parse_time("client timeout", &v.to_string())?;
        }
        if let Some(v) = client.runtime_limit {
            config.runtime_limit = parse_time("client run-time limit", &v.to_string())?;
        }
        if let Some(v) = client.print_interval {
            config.print_interval = parse_time("print interval", &v.to_string())?;
        }
        config.debug_timeout = client.debug_timeout.unwrap_or(false);
        config.log_level = toml.logging.level;

        // Command line
        if !cli.servers.is_empty() {
            servers = cli.servers;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(v) = cli.connect_timeout {
            config.connect_timeout = parse_time("connect timeout", &v)?;
        }
        if let Some(v) = cli.retries {
            config.retries = parse_retries(&v)?;
        }
        if let Some(v) = cli.retry_interval {
            config.retry_interval = parse_time("retry interval", &v)?;
        }
        if let Some(v) = cli.iomsg_size {
            config.iomsg_size = v;
        }
        if let Some(v) = cli.data_size {
            config.set_data_size(&v)?;
        }
        if let Some(v) = cli.chunk_size {
            config.chunk_size = v;
        }
        if let Some(v) = cli.offcache_buffers {
            config.offcache_buffers = v;
        }
        if let Some(v) = cli.iterations {
            config.iterations = v;
        }
        if let Some(v) = cli.window {
            config.window = v;
        }
        if let Some(v) = cli.conn_window {
            config.conn_window = v;
        }
        if let Some(v) = cli.operations {
            config.operations = parse_operations(&v)?;
        }
        if let Some(v) = cli.seed {
            config.seed = v;
        }
        if let Some(v) = cli.client_timeout {
            config.client_timeout = parse_time("client timeout", &v)?;
        }
        if let Some(v) = cli.runtime_limit {
            config.runtime_limit = parse_time("client run-time limit", &v)?;
        }
        if let Some(v) = cli.print_interval {
            config.print_interval = parse_time("print interval", &v)?;
        }
        config.validate |= cli.validate;
        config.debug_timeout |= cli.debug_timeout;
        config.verbose = cli.verbose;
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config.servers = servers
            .iter()
            .map(|s| resolve_server(s, config.port))
            .collect::<Result<_, _>>()?;

        config.validate_and_adjust()?;
        Ok(config)
    }

    pub fn is_client(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Largest payload either role puts in one transport frame.
    pub fn max_frame_len(&self) -> usize {
        self.chunk_size.max(self.iomsg_size)
    }

    fn set_data_size(&mut self, value: &str) -> Result<(), ConfigError> {
        let (min, max) = parse_data_size(value, self.max_data_size)?;
        self.min_data_size = min;
        self.max_data_size = max;
        Ok(())
    }

    fn validate_and_adjust(&mut self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(invalid("window", "0", "window size must be positive"));
        }
        if self.conn_window == 0 {
            return Err(invalid(
                "per connection window",
                "0",
                "window size must be positive",
            ));
        }
        if self.iomsg_size < HEADER_SIZE {
            return Err(invalid(
                "io message size",
                &self.iomsg_size.to_string(),
                "io message size must be at least 16 bytes",
            ));
        }
        if self.min_data_size == 0 {
            return Err(invalid("data size", "0", "minimum data size must be at least 1"));
        }
        if self.min_data_size > self.max_data_size {
            return Err(invalid(
                "data size",
                &format!("{}:{}", self.min_data_size, self.max_data_size),
                "minimum exceeds maximum",
            ));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk size", "0", "chunk size must be positive"));
        }
        if self.retries == 0 && self.is_client() {
            return Err(invalid("retries", "0", "at least one connect attempt is required"));
        }

        self.chunk_size = self.chunk_size.min(self.max_data_size);
        if self.iterations == 0 {
            self.iterations = u64::MAX;
        }
        if self.verbose {
            self.log_level = "debug".to_string();
        }
        Ok(())
    }
}

fn invalid(option: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        option,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse `<number>[h|m|s|ms|us|ns]` or `inf`. Bare numbers are seconds.
pub fn parse_time(option: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    if value == "inf" {
        return Ok(Duration::MAX);
    }

    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| invalid(option, value, "not a time value"))?;

    let seconds = match unit {
        "" | "s" => number,
        "h" => number * 3600.0,
        "m" => number * 60.0,
        "ms" => number / 1e3,
        "us" => number / 1e6,
        "ns" => number / 1e9,
        _ => return Err(invalid(option, value, "unknown time unit")),
    };

    Duration::try_from_secs_f64(seconds)
        .map_err(|_| invalid(option, value, "time value out of range"))
}

fn parse_retries(value: &str) -> Result<u64, ConfigError> {
    let value = value.trim();
    if value == "inf" {
        return Ok(u64::MAX);
    }
    value
        .parse()
        .map_err(|_| invalid("retries", value, "not a number"))
}

/// Parse `n`, `min:max`, `:max` or `min:`. A missing maximum keeps
/// `current_max`, a missing minimum means 1 byte.
pub fn parse_data_size(value: &str, current_max: usize) -> Result<(usize, usize), ConfigError> {
    let number = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| invalid("data size", value, "invalid data size range"))
    };

    match value.split_once(':') {
        None => {
            let n = number(value)?;
            Ok((n, n))
        }
        Some(("", "")) => Err(invalid("data size", value, "invalid data size range")),
        Some(("", max)) => Ok((1, number(max)?)),
        Some((min, "")) => Ok((number(min)?, current_max)),
        Some((min, max)) => Ok((number(min)?, number(max)?)),
    }
}

/// Parse a comma-separated list of operation names, dropping duplicates.
pub fn parse_operations(value: &str) -> Result<Vec<IoOp>, ConfigError> {
    let mut ops = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let op = IoOp::ALL
            .into_iter()
            .find(|op| op.name() == name)
            .ok_or_else(|| invalid("operations", name, "invalid operation name"))?;
        if !ops.contains(&op) {
            ops.push(op);
        }
    }

    if ops.is_empty() {
        return Err(invalid("operations", value, "no operation names were provided"));
    }
    Ok(ops)
}

/// Resolve `host` or `host:port`; a bare host takes `default_port`.
pub fn resolve_server(server: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    let resolved = match server.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| invalid("server", server, "invalid port number"))?;
            (host, port).to_socket_addrs()
        }
        None => (server, default_port).to_socket_addrs(),
    };

    resolved
        .map_err(|e| ConfigError::Invalid {
            option: "server",
            value: server.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| invalid("server", server, "address did not resolve"))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid {
        option: &'static str,
        value: String,
        reason: String,
    },
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
            ConfigError::Invalid {
                option,
                value,
                reason,
            } => write!(f, "invalid {option} '{value}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["iobench"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::resolve(cli(&[]), TomlConfig::default()).unwrap();
        assert!(!config.is_client());
        assert_eq!(config.port, 1337);
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.client_timeout, Duration::from_secs(50));
        assert_eq!(config.retries, u64::MAX);
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.runtime_limit, Duration::MAX);
        assert_eq!((config.min_data_size, config.max_data_size), (4096, 4096));
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.iomsg_size, 256);
        assert_eq!(config.iterations, 1000);
        assert_eq!((config.window, config.conn_window), (1, 1));
        assert_eq!(config.operations, vec![IoOp::Write]);
        assert!(!config.validate);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [network]
            port = 2000
            connect_timeout = "500ms"
            retries = 3

            [workload]
            data_size = "100:8192"
            chunk_size = 1024
            window = 8
            conn_window = 2
            operations = ["read", "write", "read"]
            validate = true

            [client]
            servers = ["127.0.0.1"]
            timeout = "inf"

            [logging]
            level = "debug"
        "#;

        let toml: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::resolve(cli(&[]), toml).unwrap();

        assert_eq!(config.servers, vec!["127.0.0.1:2000".parse().unwrap()]);
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.retries, 3);
        assert_eq!((config.min_data_size, config.max_data_size), (100, 8192));
        assert_eq!(config.chunk_size, 1024);
        assert_eq!((config.window, config.conn_window), (8, 2));
        assert_eq!(config.operations, vec![IoOp::Read, IoOp::Write]);
        assert_eq!(config.client_timeout, Duration::MAX);
        assert!(config.validate);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml: TomlConfig = toml::from_str(
            r#"
            [network]
            port = 2000
            [workload]
            window = 8
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            cli(&["-p", "3000", "-w", "4", "-o", "read", "127.0.0.1", "127.0.0.1:4000"]),
            toml,
        )
        .unwrap();

        assert_eq!(config.port, 3000);
        assert_eq!(config.window, 4);
        assert_eq!(config.operations, vec![IoOp::Read]);
        assert_eq!(
            config.servers,
            vec![
                "127.0.0.1:3000".parse().unwrap(),
                "127.0.0.1:4000".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_parse_time_units() {
        assert_eq!(parse_time("t", "2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_time("t", "1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_time("t", "2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_time("t", "1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_time("t", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_time("t", "10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_time("t", "inf").unwrap(), Duration::MAX);
        assert!(parse_time("t", "5 parsecs").is_err());
        assert!(parse_time("t", "fast").is_err());
    }

    #[test]
    fn test_parse_data_size_forms() {
        assert_eq!(parse_data_size("512", 4096).unwrap(), (512, 512));
        assert_eq!(parse_data_size("10:20", 4096).unwrap(), (10, 20));
        assert_eq!(parse_data_size(":20", 4096).unwrap(), (1, 20));
        assert_eq!(parse_data_size("10:", 4096).unwrap(), (10, 4096));
        assert!(parse_data_size(":", 4096).is_err());
        assert!(parse_data_size("x:1", 4096).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad: &[&[&str]] = &[
            &["-w", "0"],
            &["-a", "0"],
            &["-r", "8"],
            &["-d", "0"],
            &["-d", "100:10"],
            &["-k", "0"],
            &["-o", "append"],
            &["-c", "many"],
            &["-c", "0", "127.0.0.1"],
        ];
        for args in bad {
            assert!(
                Config::resolve(cli(args), TomlConfig::default()).is_err(),
                "{args:?} accepted"
            );
        }
    }

    #[test]
    fn test_adjustments() {
        let config = Config::resolve(
            cli(&["-d", "1:100", "-k", "4096", "-i", "0", "-c", "inf", "-v"]),
            TomlConfig::default(),
        )
        .unwrap();
        assert_eq!(config.chunk_size, 100);
        assert_eq!(config.iterations, u64::MAX);
        assert_eq!(config.retries, u64::MAX);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_zero_retries_in_toml_rejected() {
        let toml: TomlConfig = toml::from_str(
            r#"
            [network]
            retries = 0
            [client]
            servers = ["127.0.0.1"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            Config::resolve(cli(&[]), toml),
            Err(ConfigError::Invalid { option: "retries", .. })
        ));
    }
}
