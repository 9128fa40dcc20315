use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::instance::{VmDescription, VmSpecs, VmState};
use crate::monitor::VmStatusMonitor;
use crate::qemu::QemuFactory;
use crate::state::StateStore;

const IP_WAIT: Duration = Duration::from_secs(120);

/// Launch an instance from a description file and supervise it in the
/// foreground until the guest powers down.
pub fn execute(desc_path: &Path, factory: &QemuFactory, store: &StateStore) -> Result<()> {
    let desc = load_description(desc_path)?;
    let name = desc.vm_name.clone();

    // Make sure the store has a row before lifecycle updates flow.
    store.save_specs(&name, &VmSpecs::from_description(&desc))?;

    let monitor: Arc<dyn VmStatusMonitor> = Arc::new(store.clone());
    let vm = factory
        .create_virtual_machine(desc, monitor)
        .with_context(|| format!("failed to create instance '{name}'"))?;

    vm.start()?;
    vm.ensure_vm_is_running()?;
    store.save_specs(&name, &vm.view_specs())?;
    tracing::info!(%name, "instance is running");

    match vm.ssh_hostname(IP_WAIT) {
        Ok(ip) => println!("{name} is up at {ip}"),
        Err(e) => {
            tracing::warn!(%name, "instance has no address yet: {e}");
            println!("{name} is up, address pending");
        }
    }

    // Stay attached until the guest shuts itself down.
    while vm.current_state() != VmState::Off {
        std::thread::sleep(Duration::from_millis(500));
    }
    println!("{name} shut down");
    Ok(())
}

pub fn load_description(path: &Path) -> Result<VmDescription> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read description at {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid instance description in {}", path.display()))
}
