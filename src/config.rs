//! Configuration management for the client
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (memphis.toml)
//! - Environment variables (MEMPHIS__*)
//!
//! ## Example config file (memphis.toml):
//! ```toml
//! [connection]
//! host = "localhost"
//! port = 6666
//! username = "root"
//! connection_token = "memphis"
//! max_reconnect = 3
//!
//! [producer]
//! ack_wait_sec = 15
//!
//! [consumer]
//! pull_interval_ms = 1000
//! batch_size = 10
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MemphisError, Result};

/// Reconnect attempts are capped at this value
pub const MAX_RECONNECT_CAP: usize = 9;

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Defaults applied to new producers
    #[serde(default)]
    pub producer: ProducerDefaults,

    /// Defaults applied to new consumers
    #[serde(default)]
    pub consumer: ConsumerDefaults,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub connection_token: String,

    #[serde(default = "default_true")]
    pub reconnect: bool,

    /// Reconnect attempts; values above 9 are capped
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect: usize,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// TLS requires all three files
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,

    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,
}

/// Complete TLS material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    pub ca_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerDefaults {
    #[serde(default = "default_ack_wait_sec")]
    pub ack_wait_sec: u64,

    #[serde(default)]
    pub async_produce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerDefaults {
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_max_time_to_wait_ms")]
    pub batch_max_time_to_wait_ms: u64,

    #[serde(default = "default_max_ack_time_ms")]
    pub max_ack_time_ms: u64,

    #[serde(default = "default_max_msg_deliveries")]
    pub max_msg_deliveries: u32,
}

// Default value functions
fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6666
}

fn default_username() -> String {
    "root".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect() -> usize {
    3
}

fn default_reconnect_interval_ms() -> u64 {
    200
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_ack_wait_sec() -> u64 {
    15
}

fn default_pull_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_max_time_to_wait_ms() -> u64 {
    5_000
}

fn default_max_ack_time_ms() -> u64 {
    30_000
}

fn default_max_msg_deliveries() -> u32 {
    10
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            connection_token: String::new(),
            reconnect: true,
            max_reconnect: default_max_reconnect(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            timeout_ms: default_timeout_ms(),
            tls_key_file: None,
            tls_cert_file: None,
            tls_ca_file: None,
        }
    }
}

impl Default for ProducerDefaults {
    fn default() -> Self {
        Self {
            ack_wait_sec: default_ack_wait_sec(),
            async_produce: false,
        }
    }
}

impl Default for ConsumerDefaults {
    fn default() -> Self {
        Self {
            pull_interval_ms: default_pull_interval_ms(),
            batch_size: default_batch_size(),
            batch_max_time_to_wait_ms: default_batch_max_time_to_wait_ms(),
            max_ack_time_ms: default_max_ack_time_ms(),
            max_msg_deliveries: default_max_msg_deliveries(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, connection_token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            connection_token: connection_token.into(),
            ..Self::default()
        }
    }

    /// Host with any `http://` or `https://` scheme removed
    pub fn normalized_host(&self) -> &str {
        self.host
            .strip_prefix("http://")
            .or_else(|| self.host.strip_prefix("https://"))
            .unwrap_or(&self.host)
    }

    pub fn effective_max_reconnect(&self) -> usize {
        self.max_reconnect.min(MAX_RECONNECT_CAP)
    }

    /// TLS files, if configured. Partial TLS configuration is an error.
    pub fn tls(&self) -> Result<Option<TlsFiles>> {
        match (&self.tls_key_file, &self.tls_cert_file, &self.tls_ca_file) {
            (None, None, None) => Ok(None),
            (Some(key), Some(cert), Some(ca)) => Ok(Some(TlsFiles {
                key_file: key.clone(),
                cert_file: cert.clone(),
                ca_file: ca.clone(),
            })),
            (None, _, _) => Err(MemphisError::Config("Must provide a TLS key file".to_string())),
            (_, None, _) => Err(MemphisError::Config("Must provide a TLS cert file".to_string())),
            (_, _, None) => Err(MemphisError::Config("Must provide a TLS ca file".to_string())),
        }
    }
}

impl ProducerDefaults {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_sec)
    }
}

impl ClientConfig {
    /// Load configuration from default locations
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = ["memphis.toml", ".memphis.toml", "config/memphis.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "memphis", "client") {
            let xdg_config = config_dir.config_dir().join("memphis.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (MEMPHIS__*)
        builder = builder.add_source(
            Environment::with_prefix("MEMPHIS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}
