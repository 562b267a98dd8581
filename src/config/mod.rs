//! Configuration management
//!
//! A TOML file with optional `[client]`, `[server]` and `[logging]` sections.
//! Every field has a default, so a partial file (or no file at all) is valid.
//! The binaries layer CLI flags and environment variables on top.

use crate::crypto::CipherKind;
use crate::protocol::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local (SOCKS5) endpoint configuration
    pub client: Option<ClientConfig>,
    /// Egress endpoint configuration
    pub server: Option<ServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from `path` when given, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> crate::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

fn parse_cipher(method: &str) -> crate::Result<CipherKind> {
    method
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid method: {}", e)))
}

/// Local endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel URL (`ws://` or `wss://`)
    pub url: String,
    /// Shared secret
    pub key: String,
    /// Cipher name
    pub method: String,
    /// Local inactivity timeout in seconds
    pub timeout: u64,
    /// SOCKS5 listen host
    pub local_host: String,
    /// SOCKS5 listen port
    pub local_port: u16,
    /// WebSocket dial timeout in seconds
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:80/".to_string(),
            key: "wsdog".to_string(),
            method: CipherKind::Aes256Gcm.as_str().to_string(),
            timeout: DEFAULT_IDLE_TIMEOUT,
            local_host: "127.0.0.1".to_string(),
            local_port: 1080,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn cipher(&self) -> crate::Result<CipherKind> {
        parse_cipher(&self.method)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::default().with_idle_timeout(self.timeout)
    }
}

/// Egress endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// WebSocket path tunnels are accepted on
    pub path: String,
    /// Shared secret
    pub key: String,
    /// Cipher name
    pub method: String,
    /// Outbound connect timeout in seconds
    pub connect_timeout: u64,
    /// Seconds a new connection gets to upgrade and send its first frame
    pub handshake_timeout: u64,
    /// TLS certificate chain (PEM)
    pub tls_cert: Option<String>,
    /// TLS private key (PEM)
    pub tls_key: Option<String>,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            path: "/".to_string(),
            key: "wsdog".to_string(),
            method: CipherKind::Aes256Gcm.as_str().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls_cert: None,
            tls_key: None,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn cipher(&self) -> crate::Result<CipherKind> {
        parse_cipher(&self.method)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Tunnel path with a leading slash
    pub fn normalized_path(&self) -> String {
        if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        client: Some(ClientConfig::default()),
        server: Some(ServerConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let client = ClientConfig::default();
        assert_eq!(client.listen_addr(), "127.0.0.1:1080");
        assert_eq!(client.cipher().unwrap(), CipherKind::Aes256Gcm);
        assert_eq!(
            client.session_settings().idle_timeout,
            Duration::from_secs(60)
        );

        let server = ServerConfig::default();
        assert_eq!(server.listen_addr(), "0.0.0.0:80");
        assert_eq!(server.normalized_path(), "/");
        assert_eq!(server.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[client]\nurl = \"wss://example.com/ws\"\nmethod = \"AES-128-GCM\"\n\n[server]\npath = \"ws\"\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.url, "wss://example.com/ws");
        assert_eq!(client.cipher().unwrap(), CipherKind::Aes128Gcm);
        assert_eq!(client.local_port, 1080);

        let server = config.server.unwrap();
        assert_eq!(server.normalized_path(), "/ws");
        assert_eq!(server.port, 80);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unknown_cipher() {
        let client = ClientConfig {
            method: "rc4-md5".to_string(),
            ..Default::default()
        };
        assert!(matches!(client.cipher(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wsdog.toml");

        let mut config = generate_example_config();
        if let Some(server) = config.server.as_mut() {
            server.tls_cert = Some("/etc/wsdog/cert.pem".to_string());
            server.max_connections = 64;
        }
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        let server = loaded.server.unwrap();
        assert_eq!(server.tls_cert.as_deref(), Some("/etc/wsdog/cert.pem"));
        assert_eq!(server.max_connections, 64);
        assert!(loaded.client.is_some());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load("/nonexistent/wsdog.toml").is_err());
        assert!(Config::load_or_default(None::<&str>).unwrap().client.is_none());
    }
}
