use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

/// Top-level RCL configuration, loaded from rcl.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RclConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique node identifier; every handle this server issues carries it
    #[serde(default)]
    pub server_id: u16,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// TLS certificate path
    pub cert_path: Option<String>,
    /// TLS private key path
    pub key_path: Option<String>,
    /// Which devices to expose (None = all)
    pub expose_devices: Option<Vec<u32>>,
    /// Maximum clients
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    /// Disconnect a client after this many idle seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Native driver selection
    #[serde(default)]
    pub driver: DriverKind,
    /// Number of emulated devices when the host driver is in use
    #[serde(default = "default_host_devices")]
    pub host_devices: u32,
    /// Enable command-queue profiling where the device supports it
    #[serde(default)]
    pub enable_profiling: bool,
    /// Other nodes reachable for cross-node buffer copies
    #[serde(default)]
    pub peers: Vec<ServerEndpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Servers to connect to
    #[serde(default)]
    pub servers: Vec<ServerEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Server address (host:port)
    pub address: String,
    /// Authentication token
    #[serde(default)]
    pub token: String,
    /// Wrap the connection in TLS
    #[serde(default)]
    pub tls: bool,
    /// Custom CA certificate for TLS (optional)
    pub ca_cert: Option<String>,
}

impl ServerEndpoint {
    pub fn plain(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: token.into(),
            tls: false,
            ca_cert: None,
        }
    }
}

/// Native driver selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DriverKind {
    /// OpenCL if a runtime can be loaded, host emulation otherwise
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "opencl")]
    OpenCl,
    #[serde(rename = "host")]
    Host,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Accepted authentication tokens (empty = no auth required)
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// The token string
    pub token: String,
    /// Human-readable name for this client
    pub name: String,
    /// Which devices this token can open (None = all)
    pub allowed_devices: Option<Vec<u32>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            port: default_port(),
            bind: default_bind(),
            cert_path: None,
            key_path: None,
            expose_devices: None,
            max_clients: default_max_clients(),
            idle_timeout_secs: default_idle_timeout(),
            driver: DriverKind::default(),
            host_devices: default_host_devices(),
            enable_profiling: false,
            peers: Vec::new(),
        }
    }
}

impl RclConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::ConfigError(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                warn!("ignoring {}: {}", path, e);
                Self::default()
            }
        }
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\RCL\rcl.toml` (Windows) or `/etc/rcl/rcl.toml` (Linux/macOS)
/// 2. Local fallback: `./rcl.toml`
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\RCL\rcl.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/rcl/rcl.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "rcl.toml".to_string()
}

fn default_port() -> u16 {
    9777
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_max_clients() -> u32 {
    16
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_host_devices() -> u32 {
    1
}
