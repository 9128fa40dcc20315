use crate::instance::VmDescription;
use crate::platform::{tap_device_name, Platform};
use serde_json::Value;

/// qemu-img snapshot tag marking an image that holds a suspended
/// machine state.
pub const SUSPEND_TAG: &str = "suspend";

/// Metadata key carrying the machine type an instance was booted with.
pub const METADATA_MACHINE_TYPE: &str = "machine_type";

/// Metadata key that, when present, replaces the entire computed argv.
pub const METADATA_ARGUMENTS: &str = "arguments";

/// The QEMU system emulator binary for the host architecture.
pub fn qemu_binary_name() -> String {
    format!("qemu-system-{}", std::env::consts::ARCH)
}

pub fn default_machine_type() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "virt",
        _ => "pc",
    }
}

/// The argv assembled for one launch, along with the machine type it
/// boots with (recorded into metadata on suspend so a resume replays it).
#[derive(Debug, Clone)]
pub struct LaunchArguments {
    pub args: Vec<String>,
    pub machine_type: String,
}

/// Build the launch argv for an instance.
///
/// A metadata `arguments` array replaces the computed list wholesale;
/// otherwise the argv is the fixed stdio/QMP plumbing, machine and CPU
/// shape, networking, drives, the `-loadvm` resume flag when the image
/// carries the suspend tag, and finally the platform's fragments.
pub fn launch_arguments(
    desc: &VmDescription,
    metadata: &Value,
    resume: bool,
    platform: &dyn Platform,
) -> LaunchArguments {
    let machine_type = metadata
        .get(METADATA_MACHINE_TYPE)
        .and_then(Value::as_str)
        .unwrap_or_else(|| default_machine_type())
        .to_string();

    if let Some(arguments) = metadata.get(METADATA_ARGUMENTS).and_then(Value::as_array) {
        let args = arguments
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        tracing::info!(name = %desc.vm_name, "using stored arguments verbatim");
        return LaunchArguments { args, machine_type };
    }

    let mut args: Vec<String> = [
        "-nographic",
        "-serial",
        "mon:stdio",
        "-qmp",
        "stdio",
        "-chardev",
        "null,id=char0",
    ]
    .map(str::to_string)
    .to_vec();

    args.extend(["-machine".to_string(), machine_type.clone()]);
    args.extend(["-cpu".to_string(), "host".to_string()]);
    args.extend(["-smp".to_string(), desc.num_cores.to_string()]);
    args.extend(["-m".to_string(), format!("{}M", desc.mem_size.as_mebibytes())]);

    args.extend(["-nic".to_string(), nic_argument(&desc.vm_name, &desc.default_mac)]);
    for iface in &desc.extra_interfaces {
        let tap_key = format!("{}-{}", desc.vm_name, iface.id);
        args.extend(["-nic".to_string(), nic_argument(&tap_key, &iface.mac_address)]);
    }

    args.extend([
        "-drive".to_string(),
        format!(
            "file={},if=virtio,format=qcow2,discard=unmap",
            desc.image.image_path.display()
        ),
    ]);

    if resume {
        args.extend(["-loadvm".to_string(), SUSPEND_TAG.to_string()]);
    } else {
        args.extend(["-cdrom".to_string(), desc.cloud_init_iso.display().to_string()]);
    }

    args.extend(platform.vm_platform_args(desc));

    LaunchArguments { args, machine_type }
}

fn nic_argument(tap_key: &str, mac: &str) -> String {
    format!(
        "tap,ifname={},script=no,downscript=no,model=virtio-net-pci,mac={}",
        tap_device_name(tap_key),
        mac
    )
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
