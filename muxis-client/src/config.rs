//! Client settings.
//!
//! Settings are loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML file (if specified via MUXIS_CONFIG)
//! 3. Environment variables

use crate::connection::{ConnectionConfig, Endpoint, ProtocolVersion, TlsClientConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File- and environment-backed client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Server address (`host:port`, `unix:/path` or `redis://host:port/db`).
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database. Overrides a database given in a `redis://` address.
    pub database: Option<u32>,
    pub client_name: Option<String>,
    pub protocol: ProtocolSetting,
    /// Timeouts.
    pub timeouts: TimeoutSettings,
    /// Connections held by a pool.
    pub pool_size: usize,
    /// Socket read buffer size in bytes.
    pub read_buffer_size: usize,
    /// TLS settings.
    pub tls: TlsSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            username: None,
            password: None,
            database: None,
            client_name: None,
            protocol: ProtocolSetting::Resp2,
            timeouts: TimeoutSettings::default(),
            pool_size: crate::connection::DEFAULT_POOL_SIZE,
            read_buffer_size: crate::connection::DEFAULT_READ_BUFFER_SIZE,
            tls: TlsSettings::default(),
        }
    }
}

/// Protocol version as written in settings files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolSetting {
    Resp2,
    Resp3,
}

impl From<ProtocolSetting> for ProtocolVersion {
    fn from(p: ProtocolSetting) -> Self {
        match p {
            ProtocolSetting::Resp2 => ProtocolVersion::Resp2,
            ProtocolSetting::Resp3 => ProtocolVersion::Resp3,
        }
    }
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_ms: u64,
    pub request_ms: u64,
    pub read_ms: u64,
    pub write_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            request_ms: 30_000,
            read_ms: 5_000,
            write_ms: 10_000,
        }
    }
}

/// TLS settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Skip certificate verification (development only).
    pub insecure: bool,
    pub server_name: Option<String>,
}

impl ClientSettings {
    /// Loads settings from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(path) = std::env::var("MUXIS_CONFIG") {
            settings = Self::from_file(&path)?;
        }

        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Loads settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies overrides looked up through `var`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "1" || v.eq_ignore_ascii_case("true");

        if let Some(addr) = var("MUXIS_ADDR") {
            self.address = addr;
        }
        if let Some(user) = var("MUXIS_USERNAME") {
            self.username = Some(user);
        }
        if let Some(password) = var("MUXIS_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(db) = var("MUXIS_DB").and_then(|v| v.parse().ok()) {
            self.database = Some(db);
        }
        if let Some(name) = var("MUXIS_CLIENT_NAME") {
            self.client_name = Some(name);
        }
        if let Some(protocol) = var("MUXIS_PROTOCOL") {
            match protocol.to_lowercase().as_str() {
                "2" | "resp2" => self.protocol = ProtocolSetting::Resp2,
                "3" | "resp3" => self.protocol = ProtocolSetting::Resp3,
                other => tracing::warn!("Ignoring unknown MUXIS_PROTOCOL value: {}", other),
            }
        }

        let millis = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());
        if let Some(ms) = millis("MUXIS_CONNECT_TIMEOUT_MS") {
            self.timeouts.connect_ms = ms;
        }
        if let Some(ms) = millis("MUXIS_REQUEST_TIMEOUT_MS") {
            self.timeouts.request_ms = ms;
        }
        if let Some(ms) = millis("MUXIS_READ_TIMEOUT_MS") {
            self.timeouts.read_ms = ms;
        }
        if let Some(ms) = millis("MUXIS_WRITE_TIMEOUT_MS") {
            self.timeouts.write_ms = ms;
        }

        if let Some(n) = var("MUXIS_POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.pool_size = n;
        }

        if let Some(enabled) = var("MUXIS_TLS") {
            self.tls.enabled = flag(enabled);
        }
        if let Some(path) = var("MUXIS_TLS_CA_CERT") {
            self.tls.ca_cert = Some(PathBuf::from(path));
        }
        if let Some(insecure) = var("MUXIS_TLS_INSECURE") {
            self.tls.insecure = flag(insecure);
        }
        if let Some(name) = var("MUXIS_TLS_SERVER_NAME") {
            self.tls.server_name = Some(name);
        }
    }

    /// Validates the settings and builds a connection configuration.
    pub fn into_connection_config(self) -> Result<ConnectionConfig, ConfigError> {
        let (endpoint, url_db) = Endpoint::parse_with_db(&self.address)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.pool_size == 0 {
            return Err(ConfigError::Validation("pool_size must be at least 1".to_string()));
        }
        for (name, ms) in [
            ("request", self.timeouts.request_ms),
            ("read", self.timeouts.read_ms),
            ("write", self.timeouts.write_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} timeout must be non-zero",
                    name
                )));
            }
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(ConfigError::Validation(
                "username set without a password".to_string(),
            ));
        }
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            return Err(ConfigError::Validation(
                "client_cert and client_key must be set together".to_string(),
            ));
        }

        let mut config = ConnectionConfig::new(endpoint)
            .with_connect_timeout(Duration::from_millis(self.timeouts.connect_ms))
            .with_request_timeout(Duration::from_millis(self.timeouts.request_ms))
            .with_read_timeout(Duration::from_millis(self.timeouts.read_ms))
            .with_write_timeout(Duration::from_millis(self.timeouts.write_ms))
            .with_protocol(self.protocol.into())
            .with_pool_size(self.pool_size)
            .with_read_buffer_size(self.read_buffer_size)
            .with_database(self.database.or(url_db).unwrap_or(0));

        config.username = self.username;
        config.password = self.password;
        config.client_name = self.client_name;

        if self.tls.enabled {
            config.tls = Some(TlsClientConfig {
                enabled: true,
                ca_cert_path: self.tls.ca_cert,
                client_cert_path: self.tls.client_cert,
                client_key_path: self.tls.client_key,
                insecure: self.tls.insecure,
                server_name: self.tls.server_name,
            });
        }

        Ok(config)
    }
}

/// Settings error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_settings() {
        let config = ClientSettings::default().into_connection_config().unwrap();
        assert_eq!(config.endpoint, Endpoint::tcp("127.0.0.1", 6379));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.database, 0);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "address: redis://cache.internal:6390/4\n\
             client_name: billing\n\
             protocol: resp3\n\
             timeouts:\n  request_ms: 1500\n\
             tls:\n  enabled: true\n  insecure: true\n"
        )
        .unwrap();

        let settings = ClientSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.timeouts.connect_ms, 10_000);

        let config = settings.into_connection_config().unwrap();
        assert_eq!(config.endpoint, Endpoint::tcp("cache.internal", 6390));
        assert_eq!(config.database, 4);
        assert_eq!(config.protocol, ProtocolVersion::Resp3);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.client_name.as_deref(), Some("billing"));
        assert!(config.tls.unwrap().insecure);
    }

    #[test]
    fn test_missing_file() {
        let err = ClientSettings::from_file("/nonexistent/muxis.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn test_malformed_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pool_size: [not, a, number]").unwrap();
        let err = ClientSettings::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = ClientSettings::default();
        settings.apply_overrides(env(&[
            ("MUXIS_ADDR", "unix:/run/redis.sock"),
            ("MUXIS_PASSWORD", "hunter2"),
            ("MUXIS_DB", "2"),
            ("MUXIS_PROTOCOL", "3"),
            ("MUXIS_REQUEST_TIMEOUT_MS", "250"),
            ("MUXIS_POOL_SIZE", "8"),
            ("MUXIS_TLS", "true"),
            ("MUXIS_TLS_SERVER_NAME", "redis.local"),
        ]));

        let config = settings.into_connection_config().unwrap();
        assert_eq!(config.endpoint, Endpoint::Unix(PathBuf::from("/run/redis.sock")));
        assert_eq!(config.password.as_deref(), Some("hunter2"));
        assert_eq!(config.database, 2);
        assert_eq!(config.protocol, ProtocolVersion::Resp3);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.pool_size, 8);
        assert_eq!(
            config.tls.unwrap().server_name.as_deref(),
            Some("redis.local")
        );
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let mut settings = ClientSettings::default();
        settings.apply_overrides(env(&[("MUXIS_DB", "abc"), ("MUXIS_PROTOCOL", "resp9")]));
        assert_eq!(settings.database, None);
        assert_eq!(settings.protocol, ProtocolSetting::Resp2);
    }

    #[test]
    fn test_validation() {
        let settings = ClientSettings {
            pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.into_connection_config(),
            Err(ConfigError::Validation(_))
        ));

        let settings = ClientSettings {
            username: Some("app".into()),
            ..Default::default()
        };
        assert!(settings.into_connection_config().is_err());

        let settings = ClientSettings {
            address: "host:99999".into(),
            ..Default::default()
        };
        assert!(settings.into_connection_config().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for (zeroed, expected) in [
            (TimeoutSettings { request_ms: 0, ..Default::default() }, "request"),
            (TimeoutSettings { read_ms: 0, ..Default::default() }, "read"),
            (TimeoutSettings { write_ms: 0, ..Default::default() }, "write"),
        ] {
            let settings = ClientSettings {
                timeouts: zeroed,
                ..Default::default()
            };
            match settings.into_connection_config() {
                Err(ConfigError::Validation(msg)) => {
                    assert_eq!(msg, format!("{} timeout must be non-zero", expected))
                }
                other => panic!("expected validation error, got {:?}", other.map(|_| ())),
            }
        }

        let settings = ClientSettings {
            timeouts: TimeoutSettings {
                read_ms: 1,
                write_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.into_connection_config().is_ok());
    }
}
