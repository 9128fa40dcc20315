use crate::qemu::QemuFactory;
use anyhow::Result;

pub fn execute(factory: &QemuFactory) -> Result<()> {
    println!("{}", factory.get_backend_version_string());
    Ok(())
}
