//! Core types used throughout shunt.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of an application whose traffic is captured.
///
/// What an identifier names is up to the [`InterfaceProvider`](crate::tun::InterfaceProvider):
/// a package name on a mobile host, a local user account on Linux.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AppId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A resolved application, as reported by the interface provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub id: AppId,
    /// Human readable label used in status text.
    pub display_name: String,
}

impl AppInfo {
    pub fn new(id: impl Into<AppId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Upstream proxy address as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, including bracketed IPv6 hosts.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Proxy credentials.
///
/// Wiped from memory on drop, and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Authentication is injected only when both halves are present.
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// Everything needed to start one capture session.
///
/// Immutable once a session starts; replacing it requires a stop/start cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub proxy: ProxyTarget,
    pub credentials: Credentials,
    target_apps: Vec<AppId>,
}

impl SessionConfig {
    /// Build a session config. Duplicate app ids are dropped, first occurrence wins.
    pub fn new(proxy: ProxyTarget, credentials: Credentials, apps: impl IntoIterator<Item = AppId>) -> Self {
        let mut target_apps: Vec<AppId> = Vec::new();
        for app in apps {
            if !target_apps.contains(&app) {
                target_apps.push(app);
            }
        }
        Self {
            proxy,
            credentials,
            target_apps,
        }
    }

    pub fn target_apps(&self) -> &[AppId] {
        &self.target_apps
    }

    /// Same proxy and credentials, different apps.
    pub fn with_apps(self, apps: impl IntoIterator<Item = AppId>) -> Self {
        Self::new(self.proxy, self.credentials, apps)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_complete()
    }
}

/// The endpoint the packet translation engine is actually pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedEndpoint {
    /// Straight to the upstream proxy.
    Direct(ProxyTarget),
    /// Through the local authenticating relay.
    Relayed { port: u16 },
}

impl ResolvedEndpoint {
    /// Loopback address the relay listens on.
    pub const RELAY_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

    /// Derive the endpoint for a session.
    pub fn resolve(config: &SessionConfig, relay_port: u16) -> Self {
        if config.has_credentials() {
            Self::Relayed { port: relay_port }
        } else {
            Self::Direct(config.proxy.clone())
        }
    }

    pub fn host(&self) -> String {
        match self {
            Self::Direct(target) => target.host.clone(),
            Self::Relayed { .. } => Self::RELAY_HOST.to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Direct(target) => target.port,
            Self::Relayed { port } => *port,
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, Self::Relayed { .. })
    }

    /// Socket address of the relay, if one is interposed.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Relayed { port } => Some(SocketAddr::from((Self::RELAY_HOST, *port))),
            Self::Direct(_) => None,
        }
    }
}

impl fmt::Display for ResolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(target) => write!(f, "{target}"),
            Self::Relayed { port } => write!(f, "{}:{port}", Self::RELAY_HOST),
        }
    }
}

/// Tunnel session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result codes of the session control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Ok,
    AlreadyRunningRestarted,
    NoValidTargets,
    EngineUnavailable,
    BindFailed,
    PermissionDenied,
    InterfaceUnavailable,
}

impl SessionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::AlreadyRunningRestarted)
    }

    /// Process exit code used by the command line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ok | Self::AlreadyRunningRestarted => 0,
            Self::NoValidTargets => 2,
            Self::EngineUnavailable => 3,
            Self::BindFailed => 4,
            Self::PermissionDenied => 5,
            Self::InterfaceUnavailable => 6,
        }
    }

    /// Short, user facing explanation.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "proxy session started",
            Self::AlreadyRunningRestarted => "proxy session restarted",
            Self::NoValidTargets => "no apps selected",
            Self::EngineUnavailable => "packet engine unavailable",
            Self::BindFailed => "local relay port unavailable",
            Self::PermissionDenied => "VPN permission unavailable",
            Self::InterfaceUnavailable => "virtual interface unavailable",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Outcome of a successful session start.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub endpoint: ResolvedEndpoint,
    /// Apps whose traffic is captured.
    pub apps: Vec<AppInfo>,
    /// Requested ids that could not be resolved.
    pub skipped: Vec<AppId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(user: &str, pass: &str) -> SessionConfig {
        SessionConfig::new(
            ProxyTarget::new("proxy.example.com", 3128),
            Credentials::new(user, pass),
            vec![AppId::from("com.example.app")],
        )
    }

    #[test]
    fn test_endpoint_direct_without_credentials() {
        for (user, pass) in [("", ""), ("alice", ""), ("", "secret")] {
            let endpoint = ResolvedEndpoint::resolve(&config(user, pass), 8888);
            assert_eq!(
                endpoint,
                ResolvedEndpoint::Direct(ProxyTarget::new("proxy.example.com", 3128))
            );
            assert!(!endpoint.is_relayed());
        }
    }

    #[test]
    fn test_endpoint_relayed_with_credentials() {
        let endpoint = ResolvedEndpoint::resolve(&config("alice", "secret"), 8888);
        assert_eq!(endpoint.host(), "127.0.0.1");
        assert_eq!(endpoint.port(), 8888);
        assert_eq!(endpoint.relay_addr(), Some("127.0.0.1:8888".parse().unwrap()));
    }

    #[test]
    fn test_target_apps_deduplicated() {
        let config = SessionConfig::new(
            ProxyTarget::new("h", 1),
            Credentials::none(),
            ["b", "a", "b"].into_iter().map(AppId::from),
        );
        assert_eq!(config.target_apps(), &[AppId::from("b"), AppId::from("a")]);
    }

    #[test]
    fn test_with_apps_keeps_proxy() {
        let config = config("alice", "secret").with_apps(["x", "y", "x"].into_iter().map(AppId::from));
        assert_eq!(config.proxy, ProxyTarget::new("proxy.example.com", 3128));
        assert!(config.has_credentials());
        assert_eq!(config.target_apps(), &[AppId::from("x"), AppId::from("y")]);
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let debug = format!("{:?}", Credentials::new("alice", "secret"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_proxy_target_parse() {
        assert_eq!(ProxyTarget::parse("proxy:8080"), Some(ProxyTarget::new("proxy", 8080)));
        assert_eq!(ProxyTarget::parse("[::1]:3128"), Some(ProxyTarget::new("::1", 3128)));
        assert_eq!(ProxyTarget::parse("[::1]:3128").unwrap().to_string(), "[::1]:3128");
        assert!(ProxyTarget::parse("no-port").is_none());
        assert!(ProxyTarget::parse(":80").is_none());
    }

    #[test]
    fn test_status_codes() {
        assert!(SessionStatus::AlreadyRunningRestarted.is_success());
        assert!(!SessionStatus::BindFailed.is_success());
        assert_eq!(SessionStatus::NoValidTargets.message(), "no apps selected");
    }
}
