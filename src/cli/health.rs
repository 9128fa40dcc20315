use crate::qemu::QemuFactory;
use anyhow::Result;

pub fn execute(factory: &QemuFactory) -> Result<()> {
    factory.hypervisor_health_check()?;
    println!("the host is fit to run instances");
    Ok(())
}
