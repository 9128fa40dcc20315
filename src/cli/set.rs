use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::cli::run::load_description;
use crate::monitor::VmStatusMonitor;
use crate::qemu::QemuFactory;
use crate::settings::{InstanceRegistry, InstanceSettingsHandler};
use crate::state::StateStore;

/// Apply a sizing property (`cpus`, `memory` or `disk`) to a stopped
/// instance through the settings handler.
pub fn execute(
    desc_path: &Path,
    property: &str,
    value: &str,
    factory: &QemuFactory,
    store: &StateStore,
) -> Result<()> {
    let desc = load_description(desc_path)?;
    let name = desc.vm_name.clone();

    let monitor: Arc<dyn VmStatusMonitor> = Arc::new(store.clone());
    let vm = factory
        .create_virtual_machine(desc, monitor)
        .with_context(|| format!("failed to create instance '{name}'"))?;

    let registry = Arc::new(Mutex::new(InstanceRegistry::default()));
    registry.lock().unwrap().insert(vm.clone());

    let persist_store = store.clone();
    let persist_vm = vm.clone();
    let handler = InstanceSettingsHandler::new(
        registry,
        Box::new(move |instance| {
            if let Err(e) = persist_store.save_specs(instance, &persist_vm.view_specs()) {
                tracing::error!(instance, "failed to persist specs: {e}");
            }
        }),
    );

    let key = format!("local.{name}.{property}");
    handler.set(&key, value)?;
    println!("{key} = {}", handler.get(&key)?);
    Ok(())
}
