//! Virtual interface provisioning and the tunnel session manager.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Captured applications                      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │            Virtual interface (scoped to allowed apps)            │
//! │                    [IP packets read from fd]                     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                          TunnelManager                           │
//! │  ┌────────────────┐   ┌──────────────────┐   ┌───────────────┐   │
//! │  │ InterfaceLease │──►│   TunnelEngine   │──►│   AuthRelay   │   │
//! │  │  (fd, routes)  │   │ (packets → TCP)  │   │ (credentials) │   │
//! │  └────────────────┘   └──────────────────┘   └───────┬───────┘   │
//! ├──────────────────────────────────────────────────────┼───────────┤
//! │                    Upstream HTTP proxy ◄─────────────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The relay sits in the path only when the session carries credentials;
//! otherwise the engine talks to the upstream proxy directly.
//!
//! ## Platform Support
//!
//! - **Linux**: `/dev/net/tun` plus uid-scoped policy routing, apps are
//!   local user accounts ([`LinuxTunProvider`])
//! - **Elsewhere**: supply an [`InterfaceProvider`]

mod activity;
mod device;
mod manager;
mod provider;
mod routing;

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

pub use activity::{ActivityIndicator, ActivitySummary, LogIndicator};
pub use device::TunDevice;
pub use manager::{SessionEvent, TunnelManager};
pub use provider::{LinuxTunProvider, LocalUser};
pub use routing::UidRouting;

use crate::error::Result;
use crate::types::{AppId, AppInfo};

/// Raw descriptor of an established virtual interface.
pub type InterfaceFd = std::os::raw::c_int;

/// Address assigned to the interface.
pub const DEFAULT_TUNNEL_IPV4: Ipv4Addr = Ipv4Addr::new(10, 1, 10, 1);

/// Prefix length of the interface address.
pub const DEFAULT_TUNNEL_PREFIX: u8 = 32;

/// DNS server advertised on the interface.
pub const DEFAULT_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Route captured through the interface.
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// Interface settings from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Device name hint.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_address")]
    pub address: Ipv4Addr,

    #[serde(default = "default_prefix")]
    pub prefix: u8,

    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<IpAddr>,

    /// Destination captured for the allowed apps.
    #[serde(default = "default_route")]
    pub route: String,

    /// Policy routing table (Linux).
    #[serde(default = "default_table_id")]
    pub table_id: u32,

    /// Priority of the per-uid rules (Linux).
    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,
}

fn default_device_name() -> String {
    "shunt0".to_string()
}
fn default_address() -> Ipv4Addr {
    DEFAULT_TUNNEL_IPV4
}
fn default_prefix() -> u8 {
    DEFAULT_TUNNEL_PREFIX
}
fn default_dns_servers() -> Vec<IpAddr> {
    vec![IpAddr::V4(DEFAULT_DNS)]
}
fn default_route() -> String {
    DEFAULT_ROUTE.to_string()
}
fn default_table_id() -> u32 {
    1088
}
fn default_rule_priority() -> u32 {
    1088
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            address: default_address(),
            prefix: default_prefix(),
            dns_servers: default_dns_servers(),
            route: default_route(),
            table_id: default_table_id(),
            rule_priority: default_rule_priority(),
        }
    }
}

/// What the manager asks the host for when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub mtu: i32,
    pub local_address: Ipv4Addr,
    pub prefix: u8,
    pub route: String,
    pub dns_servers: Vec<IpAddr>,
    /// Only traffic of these apps enters the interface.
    pub allowed_apps: Vec<AppInfo>,
}

impl InterfaceRequest {
    /// Request with the default addressing.
    pub fn new(mtu: i32, allowed_apps: Vec<AppInfo>) -> Self {
        Self {
            mtu,
            local_address: DEFAULT_TUNNEL_IPV4,
            prefix: DEFAULT_TUNNEL_PREFIX,
            route: DEFAULT_ROUTE.to_string(),
            dns_servers: default_dns_servers(),
            allowed_apps,
        }
    }

    /// Apply addressing overrides from the configuration file.
    pub fn with_config(mut self, config: &InterfaceConfig) -> Self {
        self.local_address = config.address;
        self.prefix = config.prefix;
        self.route = config.route.clone();
        self.dns_servers = config.dns_servers.clone();
        self
    }
}

/// Host facility that resolves apps and establishes app-scoped interfaces.
pub trait InterfaceProvider: Send + Sync {
    /// Look up an app. `None` means the id does not name anything on this host.
    fn resolve_app(&self, id: &AppId) -> Option<AppInfo>;

    /// Create the interface. Fails with `PermissionDenied` or `InterfaceUnavailable`.
    fn establish(&self, request: &InterfaceRequest) -> Result<Box<dyn InterfaceLease>>;
}

/// A live interface. Released exactly once.
pub trait InterfaceLease: Send {
    fn fd(&self) -> InterfaceFd;

    fn name(&self) -> &str;

    /// Tear the interface down and close the descriptor.
    fn release(self: Box<Self>) -> Result<()>;
}

/// Check if the current process may create TUN devices and install routes.
pub fn check_privileges() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = InterfaceRequest::new(1500, vec![AppInfo::new("alice", "Alice")]);
        assert_eq!(request.local_address.to_string(), "10.1.10.1");
        assert_eq!(request.prefix, 32);
        assert_eq!(request.route, "0.0.0.0/0");
        assert_eq!(request.dns_servers, vec!["8.8.8.8".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_config_overrides() {
        let config = InterfaceConfig {
            address: Ipv4Addr::new(10, 9, 0, 1),
            route: "10.0.0.0/8".into(),
            ..Default::default()
        };
        let request = InterfaceRequest::new(1400, Vec::new()).with_config(&config);
        assert_eq!(request.local_address, Ipv4Addr::new(10, 9, 0, 1));
        assert_eq!(request.route, "10.0.0.0/8");
        assert_eq!(request.mtu, 1400);
    }

    #[test]
    fn test_check_privileges() {
        // Should not panic
        let _ = check_privileges();
    }
}
