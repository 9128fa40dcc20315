use crate::state::StateStore;
use anyhow::Result;

pub fn execute(store: &StateStore) -> Result<()> {
    let instances = store.list_instances()?;
    if instances.is_empty() {
        println!("no instances");
        return Ok(());
    }

    for (name, state) in instances {
        println!("{name:<24} {state}");
    }
    Ok(())
}
