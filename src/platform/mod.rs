// Host-side resource management behind a capability set, injected into
// every instance at construction.
pub mod linux;

pub use linux::LinuxPlatform;

use crate::instance::VmDescription;
use crate::Result;
use sha2::{Digest, Sha256};

/// Host-side resource lifecycle for one hypervisor backend: per-instance
/// argv fragments, DHCP lease lookup and resource teardown.
pub trait Platform: Send + Sync {
    /// Extra argv fragments for launching an instance (networking, accel).
    fn vm_platform_args(&self, desc: &VmDescription) -> Vec<String>;

    /// Argv for the `-dump-vmstate` probe run; may be empty.
    fn vmstate_platform_args(&self) -> Vec<String>;

    /// The current DHCP lease for `mac`, if one is known.
    fn get_ip_for(&self, mac: &str) -> Option<String>;

    /// Release tap device, firewall rules and state files. Idempotent.
    fn remove_resources_for(&self, vm_name: &str) -> Result<()>;

    /// Fails when the host is unfit to run instances.
    fn platform_health_check(&self) -> Result<()>;

    /// Sub-directory under the data root for this backend's files.
    fn get_directory_name(&self) -> String;
}

/// Deterministic tap device name for an instance. Kept under the kernel's
/// 15-character IFNAMSIZ limit.
pub fn tap_device_name(vm_name: &str) -> String {
    let digest = Sha256::digest(vm_name.as_bytes());
    format!("tap-{}", &hex::encode(digest)[..8])
}

/// Deterministic locally-administered unicast MAC for an instance, in the
/// QEMU OUI (`52:54:00`).
pub fn default_mac_for(vm_name: &str) -> String {
    let digest = Sha256::digest(vm_name.as_bytes());
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}
