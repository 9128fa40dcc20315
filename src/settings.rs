use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::memory::MemorySize;
use crate::qemu::QemuVirtualMachine;
use crate::{Result, VmError};

const CPUS_PROPERTY: &str = "cpus";
const MEMORY_PROPERTY: &str = "memory";
const DISK_PROPERTY: &str = "disk";

/// Instances the settings handler can reach, bucketed by why a write
/// might be refused.
#[derive(Default)]
pub struct InstanceRegistry {
    operative: HashMap<String, QemuVirtualMachine>,
    deleted: HashSet<String>,
    preparing: HashSet<String>,
}

impl InstanceRegistry {
    pub fn insert(&mut self, vm: QemuVirtualMachine) {
        let name = vm.vm_name().to_string();
        self.deleted.remove(&name);
        self.operative.insert(name, vm);
    }

    pub fn mark_deleted(&mut self, name: &str) {
        if self.operative.remove(name).is_some() {
            self.deleted.insert(name.to_string());
        }
    }

    pub fn begin_preparing(&mut self, name: &str) {
        self.preparing.insert(name.to_string());
    }

    pub fn end_preparing(&mut self, name: &str) {
        self.preparing.remove(name);
    }
}

/// Invoked with the instance name after a successful write, so the owner
/// can persist the updated specs.
pub type SpecPersister = Box<dyn Fn(&str) + Send + Sync>;

/// Read/write access to per-instance sizing through settings keys of the
/// form `local.<instance>.<cpus|memory|disk>`.
///
/// Writes only apply to stopped instances and only ever grow a value.
pub struct InstanceSettingsHandler {
    registry: Arc<Mutex<InstanceRegistry>>,
    persister: SpecPersister,
}

impl InstanceSettingsHandler {
    pub fn new(registry: Arc<Mutex<InstanceRegistry>>, persister: SpecPersister) -> Self {
        Self {
            registry,
            persister,
        }
    }

    pub fn get(&self, key: &str) -> Result<String> {
        let (instance, property) = parse_key(key)?;
        let registry = self.registry.lock().unwrap();
        let vm = lookup(&registry, "read settings of", instance)?;

        Ok(match property {
            CPUS_PROPERTY => vm.num_cores().to_string(),
            MEMORY_PROPERTY => vm.mem_size().to_string(),
            DISK_PROPERTY => vm.disk_space().to_string(),
            _ => unreachable!("parse_key admits only known properties"),
        })
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let (instance, property) = parse_key(key)?;
        let registry = self.registry.lock().unwrap();

        if registry.preparing.contains(instance) {
            return Err(VmError::InstanceSettings {
                op: "modify".to_string(),
                instance: instance.to_string(),
                reason: "instance is being prepared".to_string(),
            });
        }
        let vm = lookup(&registry, "modify", instance)?;

        let state = vm.current_state();
        if !state.can_resize() {
            return Err(VmError::InstanceSettings {
                op: "modify".to_string(),
                instance: instance.to_string(),
                reason: format!("instance must be stopped, but it is {state}"),
            });
        }

        match property {
            CPUS_PROPERTY => {
                let num_cores: u32 = value.parse().map_err(|_| VmError::InvalidSetting {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "not a positive integer".to_string(),
                })?;
                if num_cores == 0 {
                    return Err(VmError::InvalidSetting {
                        key: key.to_string(),
                        value: value.to_string(),
                        reason: "at least one CPU is required".to_string(),
                    });
                }
                vm.update_cpus(num_cores)?;
            }
            MEMORY_PROPERTY => vm.resize_memory(parse_size(key, value)?)?,
            DISK_PROPERTY => vm.resize_disk(parse_size(key, value)?)?,
            _ => unreachable!("parse_key admits only known properties"),
        }

        tracing::info!(instance, key, value, "applied instance setting");
        (self.persister)(instance);
        Ok(())
    }
}

fn parse_size(key: &str, value: &str) -> Result<MemorySize> {
    value
        .parse::<MemorySize>()
        .map_err(|_| VmError::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
            reason: "not a valid size".to_string(),
        })
}

/// Split `local.<instance>.<property>` into its parts.
fn parse_key(key: &str) -> Result<(&str, &str)> {
    let invalid = |reason: &str| VmError::InvalidSetting {
        key: key.to_string(),
        value: String::new(),
        reason: reason.to_string(),
    };

    let mut parts = key.split('.');
    if parts.next() != Some("local") {
        return Err(invalid("expected a 'local.<instance>.<property>' key"));
    }
    let instance = parts
        .next()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| invalid("missing instance name"))?;
    let property = parts
        .next()
        .ok_or_else(|| invalid("missing property name"))?;
    if parts.next().is_some() {
        return Err(invalid("trailing key components"));
    }

    match property {
        CPUS_PROPERTY | MEMORY_PROPERTY | DISK_PROPERTY => Ok((instance, property)),
        _ => Err(invalid("unknown property")),
    }
}

fn lookup<'a>(
    registry: &'a InstanceRegistry,
    op: &str,
    instance: &str,
) -> Result<&'a QemuVirtualMachine> {
    registry.operative.get(instance).ok_or_else(|| {
        let reason = if registry.deleted.contains(instance) {
            "instance is deleted"
        } else {
            "no such instance"
        };
        VmError::InstanceSettings {
            op: op.to_string(),
            instance: instance.to_string(),
            reason: reason.to_string(),
        }
    })
}
