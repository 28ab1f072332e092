//! Configuration management for shunt.

mod profiles;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use profiles::{generate_id, ProfileStore, ProxyKind, ProxyProfile, ProxyProfiles};

use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::proxy::RelayConfig;
use crate::tun::InterfaceConfig;
use crate::types::{AppId, Credentials, ProxyTarget, SessionConfig};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default session.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Local authenticating relay.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Virtual interface.
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Packet translation engine.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.relay.buffer_size == 0 {
            return Err(Error::InvalidConfig("relay buffer_size must be non-zero".into()));
        }

        if self.relay.max_connections == 0 {
            return Err(Error::InvalidConfig("relay max_connections must be non-zero".into()));
        }

        if self.relay.max_header_bytes < 256 {
            return Err(Error::InvalidConfig(
                "relay max_header_bytes must be at least 256".into(),
            ));
        }

        if self.interface.prefix > 32 {
            return Err(Error::InvalidConfig(format!(
                "interface prefix /{} is not an IPv4 prefix",
                self.interface.prefix
            )));
        }

        if self.engine.args.is_empty() {
            return Err(Error::InvalidConfig("engine args template is empty".into()));
        }

        if !self.proxy.host.is_empty() && self.proxy.port == 0 {
            return Err(Error::InvalidConfig("proxy port must be non-zero".into()));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "shunt").map_or_else(
            || PathBuf::from("shunt.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            proxy: ProxyConfig {
                host: "proxy.example.com".into(),
                port: 3128,
                username: "alice".into(),
                password: "secret".into(),
                apps: vec!["alice".into()],
            },
            engine: EngineConfig {
                program: Some(PathBuf::from("tun2proxy-bin")),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Default session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream HTTP proxy host.
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Apps (local users on Linux) to capture.
    #[serde(default)]
    pub apps: Vec<String>,
}

impl ProxyConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// Build a session, or `None` when no proxy is configured.
    pub fn session(&self) -> Option<SessionConfig> {
        if !self.is_configured() {
            return None;
        }
        Some(SessionConfig::new(
            ProxyTarget::new(self.host.clone(), self.port),
            Credentials::new(self.username.clone(), self.password.clone()),
            self.apps.iter().map(|s| AppId::from(s.as_str())),
        ))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path.
    pub file: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use std::sync::Mutex;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let file = config
        .file
        .as_ref()
        .map(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Failed to open log file: {e}")))
        })
        .transpose()?;

    let result = match (config.format.as_str(), file) {
        ("json", Some(file)) => subscriber
            .with(fmt::layer().json().with_writer(Mutex::new(file)))
            .try_init(),
        ("json", None) => subscriber.with(fmt::layer().json()).try_init(),
        (_, Some(file)) => subscriber
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .try_init(),
        (_, None) => subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to init logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::example().validate().is_ok());
    }

    #[test]
    fn test_roundtrip_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        Config::example().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.proxy.host, "proxy.example.com");
        assert_eq!(loaded.relay.port, 8888);
        assert_eq!(loaded.relay.connect_timeout, std::time::Duration::from_secs(10));
        assert_eq!(loaded.interface.address.to_string(), "10.1.10.1");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            host = "proxy"
            port = 8080
            apps = ["alice", "bob", "alice"]

            [relay]
            connect_timeout = "3s"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.connect_timeout, std::time::Duration::from_secs(3));
        assert_eq!(config.relay.buffer_size, 8192);

        let session = config.proxy.session().unwrap();
        assert!(!session.has_credentials());
        assert_eq!(session.target_apps().len(), 2);
    }

    #[test]
    fn test_invalid_relay_rejected() {
        let mut config = Config::default();
        config.relay.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unconfigured_proxy_has_no_session() {
        assert!(ProxyConfig::default().session().is_none());
    }
}
