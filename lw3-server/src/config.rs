//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via LW3_CONFIG)
//! 3. Environment variables

use lw3_protocol::{Credentials, Transport};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// WebSocket upgrade authentication.
    pub auth: AuthConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// Initial tree contents.
    pub tree: TreeConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("LW3_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.metrics.apply_env_overrides();
        self.tree.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.tls.validate()?;
        self.auth.validate()?;
        if self.auth.credentials().is_some() && self.network.transport != Transport::WebSocket {
            return Err(ConfigError::ValidationError(
                "auth requires the websocket transport".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Raw TCP lines or WebSocket text frames.
    pub transport: Transport,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Idle connection timeout in seconds (0 = never).
    pub idle_timeout_secs: u64,
    /// Line delimiter on the wire.
    pub frame_delimiter: String,
    /// Longest accepted request line in bytes.
    pub max_line_length: usize,
    /// Outbound messages queued per connection before dropping.
    pub outbound_buffer: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, lw3_protocol::DEFAULT_PORT)),
            transport: Transport::Tcp,
            max_connections: 1000,
            idle_timeout_secs: 0,
            frame_delimiter: "\n".to_string(),
            max_line_length: lw3_protocol::MAX_LINE_LENGTH,
            outbound_buffer: 1024,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("LW3_BIND_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(transport) = std::env::var("LW3_TRANSPORT") {
            match transport.to_ascii_lowercase().as_str() {
                "tcp" => self.transport = Transport::Tcp,
                "websocket" | "ws" => self.transport = Transport::WebSocket,
                _ => {}
            }
        }

        if let Ok(max) = std::env::var("LW3_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(timeout) = std::env::var("LW3_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }
    }

    /// Returns idle timeout as Duration. Zero disables the timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_delimiter.is_empty() {
            return Err(ConfigError::ValidationError(
                "frame_delimiter must not be empty".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "outbound_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("LW3_TLS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Ok(path) = std::env::var("LW3_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("LW3_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("LW3_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
            self.require_client_cert = true;
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Basic authentication of WebSocket upgrades. Disabled unless both
/// fields are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var("LW3_AUTH_USERNAME") {
            self.username = Some(username);
        }
        if let Ok(password) = std::env::var("LW3_AUTH_PASSWORD") {
            self.password = Some(password);
        }
    }

    /// Returns the required credentials, if authentication is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::ValidationError(
                "auth needs both username and password".to_string(),
            ));
        }
        if self.username.as_deref().is_some_and(|u| u.contains(':')) {
            return Err(ConfigError::ValidationError(
                "auth username must not contain ':'".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9107)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("LW3_METRICS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("LW3_METRICS_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Initial tree contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// JSON document merged into the tree on startup.
    pub seed_path: Option<PathBuf>,
}

impl TreeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("LW3_TREE_SEED") {
            self.seed_path = Some(PathBuf::from(path));
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 6107);
        assert_eq!(config.network.frame_delimiter, "\n");
        assert_eq!(config.network.outbound_buffer, 1024);
        assert!(config.network.idle_timeout().is_zero());
        assert!(!config.tls.enabled);
        assert_eq!(config.network.transport, Transport::Tcp);
        assert!(config.auth.credentials().is_none());
        assert_eq!(config.metrics.bind_addr.port(), 9107);
        assert!(config.tree.seed_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"127.0.0.1:7000\"\n  idle_timeout_secs: 30\ntree:\n  seed_path: /etc/lw3/tree.json"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 7000);
        assert_eq!(config.network.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(
            config.tree.seed_path,
            Some(PathBuf::from("/etc/lw3/tree.json"))
        );
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let missing = Config::from_file("/nonexistent/lw3.yaml");
        assert!(matches!(missing, Err(ConfigError::IoError(..))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network:\n  bind_addr: nowhere").unwrap();
        let invalid = Config::from_file(file.path());
        assert!(matches!(invalid, Err(ConfigError::ParseError(..))));
    }

    #[test]
    fn test_tls_validation() {
        let mut tls = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(tls.validate().is_err());

        tls.cert_path = Some("cert.pem".into());
        tls.key_path = Some("key.pem".into());
        assert!(tls.validate().is_ok());

        tls.require_client_cert = true;
        assert!(tls.validate().unwrap_err().to_string().contains("client_ca_path"));
    }

    #[test]
    fn test_network_validation() {
        let mut config = Config::default();
        config.network.frame_delimiter.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_websocket_auth() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  transport: websocket\nauth:\n  username: user\n  password: pass"
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.transport, Transport::WebSocket);
        assert_eq!(
            config.auth.credentials(),
            Some(Credentials::new("user", "pass"))
        );
        assert!(config.validate().is_ok());

        let mut tcp = config.clone();
        tcp.network.transport = Transport::Tcp;
        assert!(tcp.validate().unwrap_err().to_string().contains("websocket"));

        let mut half = config;
        half.auth.password = None;
        assert!(half.auth.credentials().is_none());
        assert!(half.validate().unwrap_err().to_string().contains("both"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.network.frame_delimiter, "\n");
    }
}
