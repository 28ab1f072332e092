//! Linux TUN device.
//!
//! The device is opened blocking: packet I/O belongs to the engine, which
//! inherits the descriptor.

use std::fs::File;
use std::io;
use std::net::Ipv4Addr;
use std::process::Command;

use crate::error::{Error, Result};

use super::InterfaceFd;

/// An open TUN device. The interface disappears when the device is dropped.
#[derive(Debug)]
pub struct TunDevice {
    name: String,
    mtu: i32,
    file: File,
}

impl TunDevice {
    /// Create a TUN device named after `name` (the kernel may pick another).
    ///
    /// # Privileges
    ///
    /// Requires root or `CAP_NET_ADMIN`.
    pub fn create(name: &str, mtu: i32) -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Self::create_linux(name, mtu)
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (name, mtu);
            Err(Error::InterfaceUnavailable(
                "TUN devices not supported on this platform".into(),
            ))
        }
    }

    #[cfg(target_os = "linux")]
    fn create_linux(name: &str, mtu: i32) -> Result<Self> {
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(open_error)?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };

        // Max 15 chars + null terminator
        let name_bytes = name.as_bytes();
        let name_len = name_bytes.len().min(libc::IFNAMSIZ - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(
                name_bytes.as_ptr(),
                ifr.ifr_name.as_mut_ptr() as *mut u8,
                name_len,
            );
        }

        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

        const TUNSETIFF: libc::c_ulong = 0x400454ca;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if ret < 0 {
            return Err(open_error(io::Error::last_os_error()));
        }

        let actual_name = unsafe {
            std::ffi::CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        tracing::info!(
            requested = %name,
            actual = %actual_name,
            mtu,
            "Created TUN device"
        );

        Ok(Self {
            name: actual_name,
            mtu,
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> i32 {
        self.mtu
    }

    pub fn fd(&self) -> InterfaceFd {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            self.file.as_raw_fd()
        }

        #[cfg(not(unix))]
        {
            -1
        }
    }

    /// Set MTU and address, then bring the link up.
    pub fn configure(&self, address: Ipv4Addr, prefix: u8) -> Result<()> {
        let mtu = self.mtu.to_string();
        run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu])?;

        let cidr = format!("{address}/{prefix}");
        run_ip(&["addr", "add", &cidr, "dev", &self.name])?;

        run_ip(&["link", "set", "dev", &self.name, "up"])?;
        Ok(())
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        tracing::debug!(name = %self.name, "Closing TUN device");
    }
}

fn open_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::PermissionDenied => {
            Error::PermissionDenied(format!("cannot open /dev/net/tun: {e}"))
        }
        _ => Error::InterfaceUnavailable(format!("cannot create TUN device: {e}")),
    }
}

/// Run `ip` with `args`. "File exists" is not an error.
pub(super) fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::InterfaceUnavailable(format!("cannot run ip: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            return Ok(());
        }
        if stderr.contains("Operation not permitted") {
            return Err(Error::PermissionDenied(format!(
                "ip {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        return Err(Error::InterfaceUnavailable(format!(
            "ip {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let denied = open_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, Error::PermissionDenied(_)));

        let missing = open_error(io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(missing, Error::InterfaceUnavailable(_)));
    }
}
