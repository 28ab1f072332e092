//! Linux interface provider: apps are local user accounts.

use tracing::{debug, info, warn};

use super::device::TunDevice;
use super::routing::UidRouting;
use super::{InterfaceConfig, InterfaceFd, InterfaceLease, InterfaceProvider, InterfaceRequest};
use crate::error::{Error, Result};
use crate::types::{AppId, AppInfo};

/// A local account that can be captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub uid: u32,
    pub name: String,
    /// First GECOS field, or the account name when that is empty.
    pub display_name: String,
}

impl LocalUser {
    /// Resolve a user name or numeric uid.
    pub fn lookup(id: &str) -> Option<Self> {
        #[cfg(unix)]
        {
            use nix::unistd::{Uid, User};

            let user = match id.parse::<u32>() {
                Ok(uid) => User::from_uid(Uid::from_raw(uid)).ok().flatten(),
                Err(_) => User::from_name(id).ok().flatten(),
            }?;

            let gecos = user.gecos.to_string_lossy();
            let full_name = gecos.split(',').next().unwrap_or("").trim();
            let display_name = if full_name.is_empty() {
                user.name.clone()
            } else {
                full_name.to_string()
            };

            Some(Self {
                uid: user.uid.as_raw(),
                name: user.name,
                display_name,
            })
        }

        #[cfg(not(unix))]
        {
            let _ = id;
            None
        }
    }
}

/// [`InterfaceProvider`] backed by a TUN device and uid policy routing.
///
/// DNS is left to the host: [`InterfaceRequest::dns_servers`] is logged but
/// not installed, so captured apps keep the system resolver. With DNS
/// forwarding off the engine answers port 53 itself.
#[derive(Debug, Clone, Default)]
pub struct LinuxTunProvider {
    config: InterfaceConfig,
}

impl LinuxTunProvider {
    pub fn new(config: InterfaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }
}

impl InterfaceProvider for LinuxTunProvider {
    fn resolve_app(&self, id: &AppId) -> Option<AppInfo> {
        let user = LocalUser::lookup(id.as_str())?;
        Some(AppInfo::new(id.clone(), user.display_name))
    }

    fn establish(&self, request: &InterfaceRequest) -> Result<Box<dyn InterfaceLease>> {
        if !super::check_privileges() {
            debug!("Not running as root, relying on CAP_NET_ADMIN");
        }

        let uids = request
            .allowed_apps
            .iter()
            .map(|app| {
                LocalUser::lookup(app.id.as_str())
                    .map(|user| user.uid)
                    .ok_or_else(|| Error::InterfaceUnavailable(format!("unknown user: {}", app.id)))
            })
            .collect::<Result<Vec<_>>>()?;

        let device = TunDevice::create(&self.config.device_name, request.mtu)?;
        device.configure(request.local_address, request.prefix)?;

        let mut routing = UidRouting::new(
            device.name(),
            &request.route,
            self.config.table_id,
            self.config.rule_priority,
            uids,
        );
        routing.setup()?;

        info!(
            device = %device.name(),
            fd = device.fd(),
            apps = request.allowed_apps.len(),
            dns = ?request.dns_servers,
            "Interface established"
        );

        Ok(Box::new(TunLease { device, routing }))
    }
}

struct TunLease {
    device: TunDevice,
    routing: UidRouting,
}

impl InterfaceLease for TunLease {
    fn fd(&self) -> InterfaceFd {
        self.device.fd()
    }

    fn name(&self) -> &str {
        self.device.name()
    }

    fn release(self: Box<Self>) -> Result<()> {
        let mut lease = *self;
        lease.routing.teardown();
        info!(device = %lease.device.name(), "Interface released");
        Ok(())
    }
}

impl Drop for TunLease {
    fn drop(&mut self) {
        if self.routing.is_setup() {
            warn!(device = %self.device.name(), "Interface dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_lookup_root() {
        let by_uid = LocalUser::lookup("0").unwrap();
        assert_eq!(by_uid.uid, 0);
        assert_eq!(LocalUser::lookup(&by_uid.name).unwrap().uid, 0);
    }

    #[test]
    fn test_unknown_user_unresolved() {
        let provider = LinuxTunProvider::default();
        assert!(provider
            .resolve_app(&AppId::from("no-such-user-shunt-test"))
            .is_none());
    }
}
