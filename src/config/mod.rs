//! Configuration Module
//!
//! Provides TOML-based configuration for bufmesh with support for:
//! - Node identity and channel membership
//! - Gossip transport (bind/advertise addresses, seeds)
//! - Buffer directory storage and fetch behavior
//! - Metrics endpoint
//! - Environment variable overrides (BUFMESH_* prefix)

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node identity and channel membership
    pub node: NodeConfig,
    /// Gossip transport configuration
    pub gossip: GossipConfig,
    /// Buffer directory configuration
    pub directory: DirectoryConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Node identity and channel membership
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (auto-generated from hostname if not set). Must be
    /// unique within the channel.
    pub name: Option<String>,

    /// Group channel to join
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Channel health probe interval
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,
}

fn default_channel() -> String {
    "bufmesh".to_string()
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            channel: default_channel(),
            probe_interval: default_probe_interval(),
        }
    }
}

impl NodeConfig {
    /// Get the node name, generating from hostname if not set
    pub fn get_node_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{}", rand_id()))
        })
    }
}

/// Gossip transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Address for gossip protocol (chitchat) to bind to
    /// Default: 0.0.0.0:7946
    #[serde(default = "default_gossip_addr")]
    pub gossip_addr: SocketAddr,

    /// Advertise address for gossip protocol (what peers use to reach us)
    /// If not set, resolved from hostname or falls back to gossip_addr
    pub gossip_advertise_addr: Option<SocketAddr>,

    /// Address for point-to-point data links to bind to
    /// Default: 0.0.0.0:7947
    #[serde(default = "default_data_addr")]
    pub data_addr: SocketAddr,

    /// Advertise address for data links (what peers use to reach us)
    /// If not set, resolved from hostname or falls back to data_addr
    pub data_advertise_addr: Option<SocketAddr>,

    /// Seed nodes for cluster discovery
    /// Format: "host:port" (gossip port)
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Gossip interval
    /// Default: 1s
    #[serde(default = "default_gossip_interval", with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Grace period before a dead node is removed from gossip state
    /// Default: 30s
    #[serde(default = "default_dead_node_grace_period", with = "humantime_serde")]
    pub dead_node_grace_period: Duration,
}

fn default_gossip_addr() -> SocketAddr {
    "0.0.0.0:7946".parse().unwrap()
}

fn default_data_addr() -> SocketAddr {
    "0.0.0.0:7947".parse().unwrap()
}

fn default_gossip_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_dead_node_grace_period() -> Duration {
    Duration::from_secs(30)
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_addr: default_gossip_addr(),
            gossip_advertise_addr: None,
            data_addr: default_data_addr(),
            data_advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: default_gossip_interval(),
            dead_node_grace_period: default_dead_node_grace_period(),
        }
    }
}

impl GossipConfig {
    /// Get the gossip advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_gossip_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.gossip_advertise_addr {
            return addr;
        }

        if let Some(ip) = resolve_local_ip() {
            return SocketAddr::new(ip, self.gossip_addr.port());
        }

        self.gossip_addr
    }

    /// Get the data advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_data_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.data_advertise_addr {
            return addr;
        }

        if let Some(ip) = resolve_local_ip() {
            return SocketAddr::new(ip, self.data_addr.port());
        }

        self.data_addr
    }
}

/// Buffer directory configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Directory for spilled buffer payloads
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Payloads at or above this size are spilled to disk (bytes)
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,

    /// How long a remote fetch waits for the owner's response
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Replica key the directory registers under. All nodes on a
    /// channel must agree on it.
    #[serde(default = "default_replica_key")]
    pub replica_key: String,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./bufmesh-data")
}

fn default_spill_threshold() -> usize {
    256 * 1024
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_replica_key() -> String {
    "buffer-directory".to_string()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            spill_threshold: default_spill_threshold(),
            fetch_timeout: default_fetch_timeout(),
            replica_key: default_replica_key(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the metrics HTTP endpoint is enabled
    pub enabled: bool,
    /// HTTP bind address for metrics endpoint
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:9090".parse().unwrap(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `BUFMESH__` prefix with double underscores for nesting:
    ///    - `BUFMESH__NODE__CHANNEL=analytics` overrides `node.channel`
    ///    - `BUFMESH__GOSSIP__GOSSIP_ADDR=0.0.0.0:8946` overrides `gossip.gossip_addr`
    ///    - `BUFMESH__METRICS__ENABLED=true` overrides `metrics.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("node.channel", "bufmesh")?
            .set_default("node.probe_interval", "5s")?
            .set_default("gossip.gossip_addr", "0.0.0.0:7946")?
            .set_default("gossip.data_addr", "0.0.0.0:7947")?
            .set_default("gossip.gossip_interval", "1s")?
            .set_default("gossip.dead_node_grace_period", "30s")?
            .set_default("directory.storage_dir", "./bufmesh-data")?
            .set_default("directory.spill_threshold", 256 * 1024)?
            .set_default("directory.fetch_timeout", "10s")?
            .set_default("directory.replica_key", "buffer-directory")?
            .set_default("metrics.enabled", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (BUFMESH__NODE__CHANNEL, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("BUFMESH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.channel.is_empty() {
            return Err(ConfigError::Validation(
                "node.channel must not be empty".to_string(),
            ));
        }
        if let Some(name) = &self.node.name {
            if name.is_empty() {
                return Err(ConfigError::Validation(
                    "node.name must not be empty when set".to_string(),
                ));
            }
        }
        if self.directory.replica_key.is_empty() {
            return Err(ConfigError::Validation(
                "directory.replica_key must not be empty".to_string(),
            ));
        }
        if self.directory.spill_threshold == 0 {
            return Err(ConfigError::Validation(
                "directory.spill_threshold must be greater than zero".to_string(),
            ));
        }
        if self.directory.fetch_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "directory.fetch_timeout must be greater than zero".to_string(),
            ));
        }
        if self.gossip.gossip_interval.is_zero() {
            return Err(ConfigError::Validation(
                "gossip.gossip_interval must be greater than zero".to_string(),
            ));
        }
        if self.gossip.gossip_addr.port() != 0
            && self.gossip.gossip_addr == self.gossip.data_addr
        {
            return Err(ConfigError::Validation(
                "gossip.gossip_addr and gossip.data_addr must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    let hostname_str = hostname.to_string_lossy();

    // Try to resolve hostname:0 to get the IP
    let addr_str = format!("{}:0", hostname_str);
    addr_str
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4()) // Prefer IPv4
        .map(|addr| addr.ip())
}

/// Generate a random ID for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}
