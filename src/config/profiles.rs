//! Saved proxy servers.
//!
//! Stored as JSON (`profiles.json` in the data directory):
//!
//! ```json
//! {
//!   "servers": [{ "id": "…", "name": "office", "host": "proxy", "port": 3128,
//!                 "type": "HTTP", "username": "", "password": "", "enabled": true }],
//!   "activeServerId": "…",
//!   "globalAppList": ["alice"]
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::types::{AppId, Credentials, ProxyTarget, SessionConfig};

/// Proxy protocol of a saved server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl From<String> for ProxyKind {
    /// Anything other than `HTTP` (any case) is SOCKS5.
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case("http") {
            Self::Http
        } else {
            Self::Socks5
        }
    }
}

impl From<ProxyKind> for String {
    fn from(kind: ProxyKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks5 => write!(f, "SOCKS5"),
            Self::Http => write!(f, "HTTP"),
        }
    }
}

/// A saved proxy server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ProxyKind,
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_kind() -> ProxyKind {
    ProxyKind::Socks5
}
fn default_enabled() -> bool {
    true
}

impl ProxyProfile {
    /// New enabled profile with a fresh id.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            host: host.into(),
            port,
            kind,
            credentials: Credentials::none(),
            enabled: true,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn target(&self) -> ProxyTarget {
        ProxyTarget::new(self.host.clone(), self.port)
    }

    /// `host:port (KIND)`, suffixed with ` (auth)` when a username is set.
    pub fn display_info(&self) -> String {
        let auth = if self.credentials.username().is_empty() {
            ""
        } else {
            " (auth)"
        };
        format!("{}:{} ({}){auth}", self.host, self.port, self.kind)
    }

    /// Session through this server for `apps`.
    pub fn session(&self, apps: impl IntoIterator<Item = AppId>) -> Result<SessionConfig> {
        if self.kind != ProxyKind::Http {
            return Err(Error::InvalidConfig(format!(
                "profile '{}' is {}, only HTTP proxies can be captured",
                self.name, self.kind
            )));
        }
        Ok(SessionConfig::new(self.target(), self.credentials.clone(), apps))
    }
}

/// Every saved server plus the active selection and the global app list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyProfiles {
    #[serde(default)]
    pub servers: Vec<ProxyProfile>,
    #[serde(default)]
    pub active_server_id: Option<String>,
    #[serde(default)]
    pub global_app_list: Vec<String>,
}

impl ProxyProfiles {
    /// The active server, if it exists and is enabled.
    pub fn active_server(&self) -> Option<&ProxyProfile> {
        let id = self.active_server_id.as_deref()?;
        self.servers.iter().find(|s| s.id == id && s.enabled)
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &ProxyProfile> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Look a server up by id or name.
    pub fn find(&self, key: &str) -> Option<&ProxyProfile> {
        self.servers
            .iter()
            .find(|s| s.id == key)
            .or_else(|| self.servers.iter().find(|s| s.name == key))
    }

    pub fn global_apps(&self) -> impl Iterator<Item = AppId> + '_ {
        self.global_app_list.iter().map(|s| AppId::from(s.as_str()))
    }
}

/// JSON file store for [`ProxyProfiles`], cached after the first load.
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    cached: Option<ProxyProfiles>,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    /// `profiles.json` in the platform data directory.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "shunt").map_or_else(
            || PathBuf::from("profiles.json"),
            |dirs| dirs.data_dir().join("profiles.json"),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the profiles. A missing, blank or unreadable file yields an empty set.
    pub fn load(&mut self) -> ProxyProfiles {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }

        let profiles = match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => ProxyProfiles::default(),
            Ok(content) => match serde_json::from_str::<ProxyProfiles>(&content) {
                Ok(profiles) => {
                    info!(servers = profiles.servers.len(), "Loaded proxy profiles");
                    profiles
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Failed to parse proxy profiles");
                    ProxyProfiles::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProxyProfiles::default(),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read proxy profiles");
                ProxyProfiles::default()
            }
        };

        self.cached = Some(profiles.clone());
        profiles
    }

    pub fn save(&mut self, profiles: ProxyProfiles) -> Result<ProxyProfiles> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(&profiles)
            .map_err(|e| Error::Config(format!("Failed to serialize profiles: {e}")))?;
        std::fs::write(&self.path, content)
            .map_err(|e| Error::Config(format!("Failed to write profiles: {e}")))?;

        info!(servers = profiles.servers.len(), "Saved proxy profiles");
        self.cached = Some(profiles.clone());
        Ok(profiles)
    }

    pub fn add_server(&mut self, server: ProxyProfile) -> Result<ProxyProfiles> {
        let mut profiles = self.load();
        profiles.servers.push(server);
        self.save(profiles)
    }

    /// Replace the server with the same id.
    pub fn update_server(&mut self, server: ProxyProfile) -> Result<ProxyProfiles> {
        let mut profiles = self.load();
        if let Some(existing) = profiles.servers.iter_mut().find(|s| s.id == server.id) {
            *existing = server;
        }
        self.save(profiles)
    }

    /// Delete a server, clearing the active selection if it pointed there.
    pub fn delete_server(&mut self, id: &str) -> Result<ProxyProfiles> {
        let mut profiles = self.load();
        profiles.servers.retain(|s| s.id != id);
        if profiles.active_server_id.as_deref() == Some(id) {
            profiles.active_server_id = None;
        }
        self.save(profiles)
    }

    pub fn set_active_server(&mut self, id: Option<String>) -> Result<ProxyProfiles> {
        let mut profiles = self.load();
        profiles.active_server_id = id;
        self.save(profiles)
    }

    pub fn toggle_server_enabled(&mut self, id: &str) -> Result<ProxyProfiles> {
        let mut profiles = self.load();
        if let Some(server) = profiles.servers.iter_mut().find(|s| s.id == id) {
            server.enabled = !server.enabled;
        }
        self.save(profiles)
    }

    pub fn update_global_app_list(&mut self, apps: Vec<String>) -> Result<ProxyProfiles> {
        let mut profiles = self.load();
        profiles.global_app_list = apps;
        self.save(profiles)
    }

    /// Drop the cache so the next load reads the file.
    pub fn clear_cache(&mut self) {
        self.cached = None;
    }
}

/// Fresh unique server id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
