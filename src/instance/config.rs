use crate::memory::MemorySize;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The boot image of an instance, plus its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmImage {
    pub image_path: PathBuf,
    #[serde(default)]
    pub kernel_path: Option<PathBuf>,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    pub image_hash: String,
    pub release: String,
    pub stream: String,
}

/// An additional guest NIC beyond the management interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub mac_address: String,
}

/// Everything needed to launch an instance. Immutable once created,
/// except for the resource sizes which only ever grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescription {
    pub vm_name: String,
    pub num_cores: u32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub ssh_username: String,
    pub image: VmImage,
    pub cloud_init_iso: PathBuf,
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,
    pub default_mac: String,
}
