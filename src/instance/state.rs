use crate::instance::NetworkInterface;
use crate::memory::MemorySize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Off,
    Starting,
    Running,
    Suspending,
    Suspended,
    Restarting,
    DelayedShutdown,
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Off => write!(f, "off"),
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Suspending => write!(f, "suspending"),
            VmState::Suspended => write!(f, "suspended"),
            VmState::Restarting => write!(f, "restarting"),
            VmState::DelayedShutdown => write!(f, "delayed shutdown"),
            VmState::Unknown => write!(f, "unknown"),
        }
    }
}

impl VmState {
    /// Check if a start may be issued from this state
    pub fn can_start(&self) -> bool {
        matches!(self, VmState::Off | VmState::Suspended)
    }

    /// Check if the instance can be suspended
    pub fn can_suspend(&self) -> bool {
        matches!(self, VmState::Running)
    }

    /// Check if CPU, memory or disk may be resized
    pub fn can_resize(&self) -> bool {
        matches!(self, VmState::Off)
    }
}

/// The authoritative live shape of an instance, as persisted by the
/// status monitor. `num_cores`, `mem_size` and `disk_space` never shrink
/// over an instance's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpecs {
    pub num_cores: u32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub default_mac: String,
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
    pub state: VmState,
    #[serde(default)]
    pub mounts: BTreeMap<String, PathBuf>,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl VmSpecs {
    pub fn from_description(desc: &crate::instance::VmDescription) -> Self {
        Self {
            num_cores: desc.num_cores,
            mem_size: desc.mem_size,
            disk_space: desc.disk_space,
            default_mac: desc.default_mac.clone(),
            extra_interfaces: desc.extra_interfaces.clone(),
            ssh_username: desc.ssh_username.clone(),
            state: VmState::Off,
            mounts: BTreeMap::new(),
            metadata: empty_metadata(),
        }
    }
}
