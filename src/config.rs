//! WolfPool Configuration
//!
//! This module provides configuration structures for coordination
//! clients (builders, launchers, schedulers) and for the store server.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main WolfPool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfPoolConfig {
    /// Client-side coordination settings
    pub coordination: CoordinationConfig,

    /// Store server settings (only needed by the server process)
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One coordination server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,

    /// Client port
    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Path prefix every client path is placed under
    #[serde(default)]
    pub chroot: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            chroot: String::new(),
        }
    }

    pub fn with_chroot(mut self, chroot: impl Into<String>) -> Self {
        self.chroot = chroot.into();
        self
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // IPv6 literals need brackets to keep the port unambiguous
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => write!(f, "[{}]:{}{}", addr, self.port, self.chroot),
            _ => write!(f, "{}:{}{}", self.host, self.port, self.chroot),
        }
    }
}

/// Build the comma separated host list used in log lines and status output
pub fn build_hosts(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// TLS material for mutual authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert: Option<PathBuf>,

    /// PEM private key
    pub key: Option<PathBuf>,

    /// PEM CA bundle used to verify the peer
    pub ca: Option<PathBuf>,
}

impl TlsConfig {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>, ca: impl Into<PathBuf>) -> Self {
        Self {
            cert: Some(cert.into()),
            key: Some(key.into()),
            ca: Some(ca.into()),
        }
    }

    /// All three files, or a configuration error naming what is missing
    pub fn require(&self) -> crate::Result<(&Path, &Path, &Path)> {
        match (&self.cert, &self.key, &self.ca) {
            (Some(cert), Some(key), Some(ca)) => Ok((cert, key, ca)),
            _ => Err(crate::Error::Config(
                "A TLS connection is required; please supply the tls cert, key and ca values"
                    .into(),
            )),
        }
    }
}

/// Client-side coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Servers making up the coordination cluster
    pub servers: Vec<Endpoint>,

    /// TLS material (mandatory)
    #[serde(default)]
    pub tls: TlsConfig,

    /// Establish a read-only session
    #[serde(default)]
    pub read_only: bool,

    /// Session timeout in seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Per-attempt connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Mirror the node and request trees in memory
    #[serde(default = "default_true")]
    pub enable_cache: bool,

    /// Window in which a DELETING node stops another unused-node delete
    #[serde(default = "default_max_delete_age")]
    pub max_delete_age_secs: u64,
}

/// Store server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept client connections on
    #[serde(default = "default_server_address")]
    pub bind_address: String,

    /// Upper bound for client requested session timeouts
    #[serde(default = "default_max_session_timeout")]
    pub max_session_timeout_secs: u64,

    /// TLS material (mandatory)
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_store_port() -> u16 {
    2181
}

fn default_session_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    1
}

fn default_request_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_max_delete_age() -> u64 {
    5 * 60
}

fn default_server_address() -> String {
    "0.0.0.0:2281".to_string()
}

fn default_max_session_timeout() -> u64 {
    40
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            tls: TlsConfig::default(),
            read_only: false,
            session_timeout_secs: default_session_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            enable_cache: true,
            max_delete_age_secs: default_max_delete_age(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CoordinationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_delete_age(&self) -> Duration {
        Duration::from_secs(self.max_delete_age_secs)
    }
}

impl ServerConfig {
    pub fn max_session_timeout(&self) -> Duration {
        Duration::from_secs(self.max_session_timeout_secs)
    }
}

impl WolfPoolConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfPoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.coordination.servers.is_empty() {
            return Err(crate::Error::Config("coordination.servers cannot be empty".into()));
        }

        for server in &self.coordination.servers {
            if server.host.is_empty() {
                return Err(crate::Error::Config("coordination server host cannot be empty".into()));
            }
            if !server.chroot.is_empty() && !server.chroot.starts_with('/') {
                return Err(crate::Error::Config(format!(
                    "chroot '{}' must be an absolute path",
                    server.chroot
                )));
            }
        }

        if self.coordination.session_timeout_secs == 0 {
            return Err(crate::Error::Config("coordination.session_timeout_secs cannot be 0".into()));
        }

        if let Some(server) = &self.server {
            if server.bind_address.is_empty() {
                return Err(crate::Error::Config("server.bind_address cannot be empty".into()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[coordination]
read_only = false
max_delete_age_secs = 120

[[coordination.servers]]
host = "zk1.example.com"

[[coordination.servers]]
host = "zk2.example.com"
port = 2281
chroot = "/nodepool-test"

[coordination.tls]
cert = "/etc/wolfpool/client.pem"
key = "/etc/wolfpool/client.key"
ca = "/etc/wolfpool/ca.pem"

[server]
bind_address = "127.0.0.1:2281"
"#;

        let config = WolfPoolConfig::from_str(toml).unwrap();
        assert_eq!(config.coordination.servers.len(), 2);
        assert_eq!(config.coordination.servers[0].port, 2181);
        assert_eq!(config.coordination.servers[1].chroot, "/nodepool-test");
        assert!(config.coordination.enable_cache);
        assert_eq!(config.coordination.max_delete_age(), Duration::from_secs(120));
        assert!(config.coordination.tls.require().is_ok());
        assert_eq!(config.server.unwrap().max_session_timeout_secs, 40);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_servers_rejected() {
        let toml = r#"
[coordination]
servers = []
"#;
        assert!(matches!(
            WolfPoolConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_tls_required() {
        let tls = TlsConfig {
            cert: Some("/tmp/cert.pem".into()),
            key: None,
            ca: Some("/tmp/ca.pem".into()),
        };
        assert!(matches!(tls.require(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_build_hosts() {
        let hosts = build_hosts(&[
            Endpoint::new("zk1", 2181),
            Endpoint::new("::1", 2281).with_chroot("/test"),
            Endpoint::new("10.0.0.5", 2181),
        ]);
        assert_eq!(hosts, "zk1:2181,[::1]:2281/test,10.0.0.5:2181");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wolfpool.toml");
        std::fs::write(
            &path,
            "[coordination]\n[[coordination.servers]]\nhost = \"localhost\"\n",
        )
        .unwrap();

        let config = WolfPoolConfig::from_file(&path).unwrap();
        assert_eq!(config.coordination.servers[0].host, "localhost");
        assert!(config.server.is_none());
    }
}
