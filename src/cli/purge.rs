use crate::qemu::QemuFactory;
use crate::state::StateStore;
use anyhow::Result;

pub fn execute(name: &str, factory: &QemuFactory, store: &StateStore) -> Result<()> {
    tracing::info!(name, "purging instance");

    factory.remove_resources_for(name)?;
    store.delete_instance(name)?;

    println!("purged '{name}'");
    Ok(())
}
