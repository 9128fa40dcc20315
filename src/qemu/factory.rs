use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::instance::{NetworkInterface, VmDescription};
use crate::monitor::VmStatusMonitor;
use crate::platform::Platform;
use crate::process::{execute, HostProcessFactory, ProcessFactory, ProcessOutput, ProcessSpec};
use crate::qemu::config::qemu_binary_name;
use crate::qemu::image::{ImageOps, QemuImg};
use crate::qemu::vm::QemuVirtualMachine;
use crate::{Result, VmError};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const VMSTATE_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces the platform adapter shared by every instance of the backend.
pub type PlatformFactory = Box<dyn Fn() -> Result<Arc<dyn Platform>> + Send + Sync>;

/// Creates QEMU-backed instances and answers backend-level questions:
/// health, version, residual resource cleanup.
pub struct QemuFactory {
    data_dir: PathBuf,
    platform: Arc<dyn Platform>,
    processes: Arc<dyn ProcessFactory>,
    images: Arc<dyn ImageOps>,
}

impl QemuFactory {
    pub fn new(data_dir: PathBuf, platform_factory: PlatformFactory) -> Result<Self> {
        let platform = platform_factory()?;
        Ok(Self {
            data_dir,
            platform,
            processes: Arc::new(HostProcessFactory),
            images: Arc::new(QemuImg),
        })
    }

    /// Build an instance, wiring in this backend's shared platform
    /// adapter and collaborators. Ensures the per-instance directory
    /// under `<data_dir>/<backend_dir>/<name>` exists.
    pub fn create_virtual_machine(
        &self,
        desc: VmDescription,
        monitor: Arc<dyn VmStatusMonitor>,
    ) -> Result<QemuVirtualMachine> {
        let vm_dir = self.instance_directory(&desc.vm_name);
        std::fs::create_dir_all(&vm_dir).map_err(|e| VmError::io(&vm_dir, e))?;

        Ok(QemuVirtualMachine::new(
            desc,
            monitor,
            Arc::clone(&self.platform),
            Arc::clone(&self.processes),
            Arc::clone(&self.images),
        ))
    }

    /// Release everything an instance left behind on the host.
    pub fn remove_resources_for(&self, name: &str) -> Result<()> {
        self.platform.remove_resources_for(name)?;

        let vm_dir = self.instance_directory(name);
        match std::fs::remove_dir_all(&vm_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VmError::io(&vm_dir, e)),
        }
    }

    /// Fails when the host cannot run instances. The `-dump-vmstate`
    /// probe is advisory: a failure is logged, not fatal.
    pub fn hypervisor_health_check(&self) -> Result<()> {
        self.platform.platform_health_check()?;
        self.probe_vmstate_support();
        Ok(())
    }

    pub fn get_backend_directory_name(&self) -> String {
        self.platform.get_directory_name()
    }

    /// `qemu-<x.y.z>` from the emulator's `--version` output, or
    /// `qemu-unknown` when the probe fails or prints something else.
    pub fn get_backend_version_string(&self) -> String {
        let spec = ProcessSpec::new(qemu_binary_name(), vec!["--version".to_string()]);
        backend_version_string(&execute(&spec, VERSION_PROBE_TIMEOUT))
    }

    /// Host network listing is not available on this backend.
    pub fn networks(&self) -> Result<Vec<NetworkInterface>> {
        Err(VmError::NotImplementedOnThisBackend)
    }

    fn instance_directory(&self, name: &str) -> PathBuf {
        self.data_dir
            .join(self.platform.get_directory_name())
            .join(name)
    }

    fn probe_vmstate_support(&self) {
        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("skipping vmstate probe, no scratch dir: {e}");
                return;
            }
        };
        let out_file = scratch.path().join("vmstate.json");

        let mut args = self.platform.vmstate_platform_args();
        args.extend(["-dump-vmstate".to_string(), out_file.display().to_string()]);

        let output = execute(&ProcessSpec::new(qemu_binary_name(), args), VMSTATE_PROBE_TIMEOUT);
        if output.state.completed_normally() {
            tracing::debug!("vmstate dump supported");
        } else {
            tracing::warn!(
                "vmstate probe failed: {}",
                output.state.failure_message()
            );
        }
    }
}

/// Map a `--version` probe result onto the backend version string.
fn backend_version_string(output: &ProcessOutput) -> String {
    if !output.state.completed_normally() {
        return "qemu-unknown".to_string();
    }

    output
        .stdout_utf8()
        .lines()
        .find_map(parse_version_line)
        .map(|version| format!("qemu-{version}"))
        .unwrap_or_else(|| "qemu-unknown".to_string())
}

/// Extract `x.y` or `x.y.z` from a line like
/// `QEMU emulator version 2.11.1(Debian 1:2.11+dfsg-1ubuntu7)`.
fn parse_version_line(line: &str) -> Option<String> {
    let rest = line.split("QEMU emulator version ").nth(1)?;
    let candidate: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let numeric = |p: &&str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    let parts: Vec<&str> = candidate.split('.').collect();
    match parts.as_slice() {
        [major, minor, rest @ ..] if numeric(major) && numeric(minor) => {
            let mut version = format!("{major}.{minor}");
            if let Some(patch) = rest.first() {
                if numeric(patch) {
                    version.push_str(&format!(".{patch}"));
                }
            }
            Some(version)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessError, ProcessErrorKind, ProcessState};

    fn probe(stdout: &str, exit_code: i32) -> ProcessOutput {
        ProcessOutput {
            state: ProcessState::from_exit(exit_code),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn test_version_parsed_from_probe() {
        let output = probe(
            "QEMU emulator version 2.11.1(Debian 1:2.11+dfsg-1ubuntu7.23)\n\
             Copyright (c) 2003-2017 Fabrice Bellard and the QEMU Project developers\n",
            0,
        );
        assert_eq!(backend_version_string(&output), "qemu-2.11.1");
    }

    #[test]
    fn test_two_component_version_accepted() {
        let output = probe("QEMU emulator version 8.2, Copyright (c) 2003-2023\n", 0);
        assert_eq!(backend_version_string(&output), "qemu-8.2");
    }

    #[test]
    fn test_unparsable_version_falls_back() {
        let output = probe("Unparsable version string\n", 0);
        assert_eq!(backend_version_string(&output), "qemu-unknown");
    }

    #[test]
    fn test_nonzero_exit_falls_back() {
        let output = probe("QEMU emulator version 2.11.1\n", 1);
        assert_eq!(backend_version_string(&output), "qemu-unknown");
    }

    #[test]
    fn test_crashed_probe_falls_back() {
        let output = ProcessOutput {
            state: ProcessState::from_error(ProcessError::new(
                ProcessErrorKind::Crashed,
                "process terminated by signal 11",
            )),
            stdout: b"QEMU emulator version 2.11.1\n".to_vec(),
            stderr: Vec::new(),
        };
        assert_eq!(backend_version_string(&output), "qemu-unknown");
    }

    #[test]
    fn test_version_line_shapes() {
        assert_eq!(parse_version_line("QEMU emulator version 6.2.0"), Some("6.2.0".into()));
        assert_eq!(parse_version_line("QEMU emulator version 6"), None);
        assert_eq!(parse_version_line("QEMU emulator version 6..2"), None);
        assert_eq!(parse_version_line("no version here"), None);
    }
}
