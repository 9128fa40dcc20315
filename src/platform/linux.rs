use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::instance::VmDescription;
use crate::platform::{tap_device_name, Platform};
use crate::process::{execute, ProcessSpec};
use crate::{Result, VmError};

const IP_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// dnsmasq lease files probed in order; records are
/// `epoch MAC IP hostname clientid`.
const LEASE_PATHS: &[&str] = &[
    "/var/lib/misc/dnsmasq.leases",
    "/var/lib/dnsmasq/dnsmasq.leases",
];

/// The QEMU platform adapter for Linux hosts: KVM acceleration, tap
/// devices managed through `ip`, and DHCP leases read from dnsmasq.
pub struct LinuxPlatform {
    lease_paths: Vec<PathBuf>,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self {
            lease_paths: LEASE_PATHS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_lease_paths(lease_paths: Vec<PathBuf>) -> Self {
        Self { lease_paths }
    }

    /// AppArmor confinement of spawned QEMU processes is skipped when
    /// `DISABLE_APPARMOR=1` is set in the daemon's environment.
    fn apparmor_disabled() -> bool {
        std::env::var_os("DISABLE_APPARMOR").is_some_and(|v| v == "1")
    }

    fn create_tap_device(&self, tap: &str) {
        let output = execute(
            &ProcessSpec::new(
                "ip",
                vec!["tuntap".into(), "add".into(), tap.into(), "mode".into(), "tap".into()],
            ),
            IP_COMMAND_TIMEOUT,
        );
        if !output.state.completed_normally() {
            // Already existing is fine; anything else surfaces when QEMU opens it.
            tracing::debug!(%tap, "ip tuntap add: {}", output.stderr_utf8().trim());
        }

        let output = execute(
            &ProcessSpec::new("ip", vec!["link".into(), "set".into(), tap.into(), "up".into()]),
            IP_COMMAND_TIMEOUT,
        );
        if !output.state.completed_normally() {
            tracing::warn!(%tap, "could not bring tap up: {}", output.stderr_utf8().trim());
        }
    }

    fn find_in_path(binary: &str) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(binary))
            .find(|candidate| candidate.is_file())
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LinuxPlatform {
    fn vm_platform_args(&self, desc: &VmDescription) -> Vec<String> {
        if Self::apparmor_disabled() {
            tracing::debug!(name = %desc.vm_name, "AppArmor confinement disabled");
        }

        let tap = tap_device_name(&desc.vm_name);
        self.create_tap_device(&tap);
        for iface in &desc.extra_interfaces {
            self.create_tap_device(&tap_device_name(&format!("{}-{}", desc.vm_name, iface.id)));
        }

        vec!["-enable-kvm".to_string()]
    }

    fn vmstate_platform_args(&self) -> Vec<String> {
        vec!["-enable-kvm".to_string()]
    }

    fn get_ip_for(&self, mac: &str) -> Option<String> {
        for path in &self.lease_paths {
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            for line in content.lines() {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 3 && fields[1].eq_ignore_ascii_case(mac) {
                    return Some(fields[2].to_string());
                }
            }
        }
        None
    }

    fn remove_resources_for(&self, vm_name: &str) -> Result<()> {
        let tap = tap_device_name(vm_name);
        let output = execute(
            &ProcessSpec::new("ip", vec!["link".into(), "delete".into(), tap.clone()]),
            IP_COMMAND_TIMEOUT,
        );
        // The device is usually gone already; removal is idempotent.
        if !output.state.completed_normally() {
            tracing::debug!(%tap, "ip link delete: {}", output.stderr_utf8().trim());
        }
        Ok(())
    }

    fn platform_health_check(&self) -> Result<()> {
        if !Path::new("/dev/kvm").exists() {
            return Err(VmError::io(
                "/dev/kvm",
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "KVM is not available on this host",
                ),
            ));
        }

        let qemu = crate::qemu::config::qemu_binary_name();
        if Self::find_in_path(&qemu).is_none() {
            return Err(VmError::io(
                &qemu,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("'{qemu}' not found in PATH"),
                ),
            ));
        }

        Ok(())
    }

    fn get_directory_name(&self) -> String {
        "qemu".to_string()
    }
}
