use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::instance::{NetworkInterface, VmDescription, VmSpecs, VmState};
use crate::memory::MemorySize;
use crate::monitor::VmStatusMonitor;
use crate::platform::Platform;
use crate::process::{ProcessFactory, ProcessSpec, ProcessState};
use crate::qemu::config::{self, METADATA_MACHINE_TYPE};
use crate::qemu::image::ImageOps;
use crate::qemu::SUSPEND_TAG;
use crate::qmp::{QmpHandler, QmpSession};
use crate::{Result, VmError};

/// Upper bound on a graceful shutdown or suspend before QEMU is killed.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

const KILL_GRACE: Duration = Duration::from_secs(5);
const IP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The sentinel `management_ipv4` returns while no lease is known.
pub const UNKNOWN_IP: &str = "UNKNOWN";

struct VmShared {
    state: VmState,
    desc: VmDescription,
    session: Option<Arc<QmpSession>>,
    has_suspend_snapshot: bool,
    /// The current boot was started with `-loadvm`.
    resuming: bool,
    /// Why the last start ended in `off`, for `ensure_vm_is_running`.
    start_failure: Option<String>,
    /// Machine type of the current boot, recorded to metadata on suspend.
    machine_type: Option<String>,
}

struct VmInner {
    name: String,
    qemu_binary: String,
    monitor: Arc<dyn VmStatusMonitor>,
    platform: Arc<dyn Platform>,
    processes: Arc<dyn ProcessFactory>,
    images: Arc<dyn ImageOps>,
    shared: Mutex<VmShared>,
    state_changed: Condvar,
}

/// One QEMU-backed instance.
///
/// Owns its supervised process and QMP session for that process'
/// lifetime. All observable state lives behind one mutex; blocking
/// operations wait on the paired condition variable, which every state
/// transition notifies.
#[derive(Clone)]
pub struct QemuVirtualMachine {
    inner: Arc<VmInner>,
}

/// Routes session callbacks into the owning instance. Holds a weak
/// reference so a dangling dispatcher thread cannot keep the VM alive.
struct SessionEvents {
    inner: Weak<VmInner>,
}

impl QmpHandler for SessionEvents {
    fn on_event(&self, name: &str, _payload: &Value) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_qmp_event(name);
        }
    }

    fn on_process_finished(&self, state: ProcessState) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_process_finished(state);
        }
    }

    fn on_session_broken(&self, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_session_broken(reason);
        }
    }

    fn on_handshake(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_handshake();
        }
    }
}

impl QemuVirtualMachine {
    pub fn new(
        desc: VmDescription,
        monitor: Arc<dyn VmStatusMonitor>,
        platform: Arc<dyn Platform>,
        processes: Arc<dyn ProcessFactory>,
        images: Arc<dyn ImageOps>,
    ) -> Self {
        let has_suspend_snapshot = images.has_suspend_snapshot(&desc.image.image_path);
        if has_suspend_snapshot {
            tracing::info!(name = %desc.vm_name, "image holds a suspended machine state");
        }

        let name = desc.vm_name.clone();
        Self {
            inner: Arc::new(VmInner {
                name,
                qemu_binary: config::qemu_binary_name(),
                monitor,
                platform,
                processes,
                images,
                shared: Mutex::new(VmShared {
                    state: VmState::Off,
                    desc,
                    session: None,
                    has_suspend_snapshot,
                    resuming: false,
                    start_failure: None,
                    machine_type: None,
                }),
                state_changed: Condvar::new(),
            }),
        }
    }

    pub fn vm_name(&self) -> &str {
        &self.inner.name
    }

    /// Observed state; never waits for a transition.
    pub fn current_state(&self) -> VmState {
        self.inner.shared.lock().unwrap().state
    }

    /// Launch the instance. A no-op when it is already starting or
    /// running; from `off` the boot resumes the suspended machine state
    /// when the image carries the suspend tag.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().unwrap();
        match shared.state {
            VmState::Starting | VmState::Running => return Ok(()),
            state if state.can_start() => {}
            state => {
                return Err(VmError::InvalidStateTransition {
                    from: state.to_string(),
                    to: VmState::Starting.to_string(),
                })
            }
        }

        let metadata = inner.monitor.retrieve_metadata_for(&inner.name);
        let resume = shared.has_suspend_snapshot;
        let launch =
            config::launch_arguments(&shared.desc, &metadata, resume, inner.platform.as_ref());

        tracing::info!(name = %inner.name, resume, "starting instance");
        tracing::debug!(name = %inner.name, args = ?launch.args, "QEMU command line");

        let process = inner
            .processes
            .create(ProcessSpec::new(inner.qemu_binary.clone(), launch.args));

        shared.start_failure = None;
        shared.resuming = resume;
        shared.machine_type = Some(launch.machine_type);
        let handler: Arc<dyn QmpHandler> = Arc::new(SessionEvents {
            inner: Arc::downgrade(inner),
        });
        shared.session = Some(QmpSession::start(process, handler));
        inner.set_state_locked(&mut shared, VmState::Starting);
        Ok(())
    }

    /// Gracefully stop the instance. From `off` or `suspended` this is a
    /// no-op; while `starting` it interrupts the boot and fails any
    /// concurrent `ensure_vm_is_running`.
    pub fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().unwrap();
        match shared.state {
            VmState::Off | VmState::Suspended => {
                tracing::debug!(name = %inner.name, "ignoring shutdown, instance is not running");
                Ok(())
            }
            VmState::Starting => {
                tracing::warn!(name = %inner.name, "shutdown requested while instance is starting");
                let stderr = shared
                    .session
                    .as_ref()
                    .map(|s| s.captured_stderr())
                    .unwrap_or_default();
                let mut reason = "shutdown requested while the instance was starting".to_string();
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    reason = format!("{reason}: {stderr}");
                }
                shared.start_failure = Some(reason);

                match shared.session.clone() {
                    Some(session) if session.running() => {
                        session.kill();
                        while shared.state != VmState::Off {
                            shared = inner.state_changed.wait(shared).unwrap();
                        }
                    }
                    _ => {
                        // The child is already gone, so no exit event will
                        // arrive to drive the transition.
                        shared.session = None;
                        inner.monitor.on_shutdown();
                        inner.set_state_locked(&mut shared, VmState::Off);
                    }
                }
                Ok(())
            }
            VmState::Running | VmState::Unknown | VmState::DelayedShutdown => {
                let probe_first = shared.state == VmState::Unknown;
                let session = shared.session.clone();
                inner.set_state_locked(&mut shared, VmState::DelayedShutdown);
                drop(shared);

                let Some(session) = session else {
                    let mut shared = inner.shared.lock().unwrap();
                    inner.monitor.on_shutdown();
                    inner.set_state_locked(&mut shared, VmState::Off);
                    return Ok(());
                };

                // An instance in `unknown` may be wedged; only ask it to
                // power down if it still answers QMP.
                let responsive = !probe_first || session.execute("query-status", None).is_ok();
                if responsive {
                    if let Err(e) = session.send("system_powerdown", None) {
                        tracing::warn!(name = %inner.name, "powerdown failed, killing QEMU: {e}");
                        session.kill();
                    }
                } else {
                    tracing::warn!(name = %inner.name, "instance is unresponsive, killing QEMU");
                    session.kill();
                }

                inner.await_off(&session, "shutdown")
            }
            state => Err(VmError::InvalidStateTransition {
                from: state.to_string(),
                to: VmState::Off.to_string(),
            }),
        }
    }

    /// Snapshot the running machine state into the image (`savevm`),
    /// then stop QEMU. The instance ends `off` with the image tagged.
    pub fn suspend(&self) -> Result<()> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().unwrap();
        match shared.state {
            VmState::Off | VmState::Suspended => {
                tracing::debug!(name = %inner.name, "ignoring suspend, instance is stopped");
                Ok(())
            }
            VmState::Running => {
                let session = shared
                    .session
                    .clone()
                    .ok_or_else(|| VmError::Qmp("no active QMP session".to_string()))?;
                let machine_type = shared.machine_type.clone();
                inner.set_state_locked(&mut shared, VmState::Suspending);
                drop(shared);

                if let Some(machine_type) = machine_type {
                    inner.record_machine_type(&machine_type);
                }

                tracing::info!(name = %inner.name, "suspending instance");
                if let Err(e) = session.send_human_monitor_command(&format!("savevm {SUSPEND_TAG}"))
                {
                    tracing::warn!(name = %inner.name, "savevm failed, killing QEMU: {e}");
                    session.kill();
                }

                inner.await_off(&session, "suspend")
            }
            state => Err(VmError::InvalidStateTransition {
                from: state.to_string(),
                to: VmState::Suspending.to_string(),
            }),
        }
    }

    /// Block until the instance is `running`. Fails with the recorded
    /// start failure when the instance went back to `off` instead.
    pub fn ensure_vm_is_running(&self) -> Result<()> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().unwrap();
        loop {
            match shared.state {
                VmState::Running => return Ok(()),
                VmState::Starting | VmState::Restarting => {
                    shared = inner.state_changed.wait(shared).unwrap();
                }
                _ => {
                    let reason = shared
                        .start_failure
                        .clone()
                        .unwrap_or_else(|| "instance is not running".to_string());
                    return Err(VmError::StartFailure {
                        name: inner.name.clone(),
                        reason,
                    });
                }
            }
        }
    }

    /// The management IP once a DHCP lease appears. Failing the deadline
    /// moves a running instance to `unknown`.
    pub fn ssh_hostname(&self, timeout: Duration) -> Result<String> {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let mac = inner.shared.lock().unwrap().desc.default_mac.clone();

        loop {
            if let Some(ip) = inner.platform.get_ip_for(&mac) {
                return Ok(ip);
            }
            if Instant::now() >= deadline {
                let mut shared = inner.shared.lock().unwrap();
                if shared.state == VmState::Running {
                    tracing::warn!(name = %inner.name, "no DHCP lease appeared, state is unknown");
                    inner.set_state_locked(&mut shared, VmState::Unknown);
                }
                return Err(VmError::Timeout {
                    operation: format!("IP address of instance '{}'", inner.name),
                });
            }

            let shared = inner.shared.lock().unwrap();
            let wait = IP_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            let _ = inner.state_changed.wait_timeout(shared, wait).unwrap();
        }
    }

    /// The management IP, or the `"UNKNOWN"` sentinel when no lease is
    /// known. Never fails and never changes state.
    pub fn management_ipv4(&self) -> String {
        let mac = self.inner.shared.lock().unwrap().desc.default_mac.clone();
        self.inner
            .platform
            .get_ip_for(&mac)
            .unwrap_or_else(|| UNKNOWN_IP.to_string())
    }

    /// Grow the CPU count. Only valid while the instance is stopped.
    pub fn update_cpus(&self, num_cores: u32) -> Result<()> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().unwrap();
        inner.require_resizable(&shared)?;

        if num_cores < shared.desc.num_cores {
            return Err(VmError::InvalidSetting {
                key: "cpus".to_string(),
                value: num_cores.to_string(),
                reason: "the number of CPUs can only grow".to_string(),
            });
        }
        if num_cores != shared.desc.num_cores {
            tracing::info!(name = %inner.name, num_cores, "updating CPUs");
            shared.desc.num_cores = num_cores;
        }
        Ok(())
    }

    /// Grow the memory size. Only valid while the instance is stopped.
    pub fn resize_memory(&self, new_size: MemorySize) -> Result<()> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().unwrap();
        inner.require_resizable(&shared)?;

        if new_size < shared.desc.mem_size {
            return Err(VmError::InvalidSetting {
                key: "memory".to_string(),
                value: new_size.to_string(),
                reason: "memory can only grow".to_string(),
            });
        }
        if new_size != shared.desc.mem_size {
            tracing::info!(name = %inner.name, %new_size, "resizing memory");
            shared.desc.mem_size = new_size;
        }
        Ok(())
    }

    /// Grow the disk, resizing the backing image. Only valid while the
    /// instance is stopped.
    pub fn resize_disk(&self, new_size: MemorySize) -> Result<()> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().unwrap();
        inner.require_resizable(&shared)?;

        if new_size < shared.desc.disk_space {
            return Err(VmError::InvalidSetting {
                key: "disk".to_string(),
                value: new_size.to_string(),
                reason: "disk space can only grow".to_string(),
            });
        }
        if new_size != shared.desc.disk_space {
            tracing::info!(name = %inner.name, %new_size, "resizing disk");
            inner.images.resize(&shared.desc.image.image_path, new_size)?;
            shared.desc.disk_space = new_size;
        }
        Ok(())
    }

    /// Host network listing is not available on this backend.
    pub fn networks(&self) -> Result<Vec<NetworkInterface>> {
        Err(VmError::NotImplementedOnThisBackend)
    }

    pub fn num_cores(&self) -> u32 {
        self.inner.shared.lock().unwrap().desc.num_cores
    }

    pub fn mem_size(&self) -> MemorySize {
        self.inner.shared.lock().unwrap().desc.mem_size
    }

    pub fn disk_space(&self) -> MemorySize {
        self.inner.shared.lock().unwrap().desc.disk_space
    }

    /// A specs snapshot of the instance's current shape and state.
    pub fn view_specs(&self) -> VmSpecs {
        let shared = self.inner.shared.lock().unwrap();
        let mut specs = VmSpecs::from_description(&shared.desc);
        specs.state = shared.state;
        specs
    }
}

impl VmInner {
    /// The single place state changes: updates, persists and wakes
    /// waiters. Runs under the shared mutex.
    fn set_state_locked(&self, shared: &mut VmShared, next: VmState) {
        if shared.state != next {
            tracing::debug!(name = %self.name, from = %shared.state, to = %next, "state transition");
            shared.state = next;
            self.monitor.persist_state_for(&self.name, next);
        }
        self.state_changed.notify_all();
    }

    fn require_resizable(&self, shared: &VmShared) -> Result<()> {
        if shared.state.can_resize() {
            Ok(())
        } else {
            Err(VmError::InvalidStateTransition {
                from: shared.state.to_string(),
                to: VmState::Off.to_string(),
            })
        }
    }

    fn record_machine_type(&self, machine_type: &str) {
        let mut metadata = self.monitor.retrieve_metadata_for(&self.name);
        if !metadata.is_object() {
            metadata = json!({});
        }
        metadata[METADATA_MACHINE_TYPE] = Value::String(machine_type.to_string());
        self.monitor.update_metadata_for(&self.name, metadata);
    }

    /// Wait for the exit-driven transition to `off`, escalating to a kill
    /// when `SHUTDOWN_TIMEOUT` passes.
    fn await_off(&self, session: &Arc<QmpSession>, operation: &str) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while shared.state != VmState::Off {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (next, _) = self.state_changed.wait_timeout(shared, remaining).unwrap();
            shared = next;
        }

        if shared.state != VmState::Off {
            tracing::warn!(name = %self.name, "graceful {operation} timed out, killing QEMU");
            session.kill();
            let deadline = Instant::now() + KILL_GRACE;
            while shared.state != VmState::Off {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(VmError::Timeout {
                        operation: format!("{operation} of instance '{}'", self.name),
                    });
                }
                let (next, _) = self.state_changed.wait_timeout(shared, remaining).unwrap();
                shared = next;
            }
        }
        Ok(())
    }

    /// A resumed machine can come back with its CPUs stopped; `cont`
    /// kicks it, and the RESUME event it triggers completes the start.
    fn handle_handshake(&self) {
        let shared = self.shared.lock().unwrap();
        if shared.state != VmState::Starting || !shared.resuming {
            return;
        }
        let session = shared.session.clone();
        drop(shared);

        if let Some(session) = session {
            if let Err(e) = session.send("cont", None) {
                tracing::warn!(name = %self.name, "could not resume CPUs: {e}");
                session.kill();
            }
        }
    }

    fn handle_qmp_event(&self, name: &str) {
        let mut shared = self.shared.lock().unwrap();
        match (name, shared.state) {
            // QEMU resumes the CPUs once the boot (or loadvm) completes.
            ("RESUME", VmState::Starting) => {
                let resumed = shared.resuming;
                shared.resuming = false;
                if resumed {
                    shared.has_suspend_snapshot = false;
                }
                let image = shared.desc.image.image_path.clone();
                self.monitor.on_resume();
                self.set_state_locked(&mut shared, VmState::Running);
                drop(shared);

                if resumed {
                    // The snapshot was consumed; the next boot is fresh.
                    if let Err(e) = self.images.delete_suspend_snapshot(&image) {
                        tracing::warn!(name = %self.name, "could not drop suspend snapshot: {e}");
                    }
                }
            }
            // RESUME while suspending means savevm finished writing.
            ("RESUME", VmState::Suspending) => {
                shared.has_suspend_snapshot = true;
                let session = shared.session.clone();
                drop(shared);
                if let Some(session) = session {
                    session.kill();
                }
            }
            ("SHUTDOWN" | "POWERDOWN" | "STOP", _) => {
                tracing::debug!(name = %self.name, event = name, "guest lifecycle event");
            }
            _ => tracing::trace!(name = %self.name, event = name, "unhandled QMP event"),
        }
    }

    fn handle_process_finished(&self, process_state: ProcessState) {
        let mut shared = self.shared.lock().unwrap();
        let stderr = shared
            .session
            .as_ref()
            .map(|s| s.captured_stderr())
            .unwrap_or_default();
        shared.session = None;

        match shared.state {
            // A fast-path shutdown already drove the transition.
            VmState::Off => self.state_changed.notify_all(),
            VmState::Starting => {
                let reason = shared.start_failure.take().unwrap_or_else(|| {
                    let mut reason = process_state.failure_message();
                    let stderr = stderr.trim();
                    if !stderr.is_empty() {
                        reason = format!("{reason}: {stderr}");
                    }
                    reason
                });
                tracing::error!(name = %self.name, "instance failed to start: {reason}");
                shared.start_failure = Some(reason);
                self.monitor.on_shutdown();
                self.set_state_locked(&mut shared, VmState::Off);
            }
            VmState::Suspending => {
                if shared.has_suspend_snapshot {
                    tracing::info!(name = %self.name, "instance suspended");
                    self.monitor.on_suspend();
                } else {
                    tracing::warn!(name = %self.name, "QEMU exited before savevm completed");
                    self.monitor.on_shutdown();
                }
                self.set_state_locked(&mut shared, VmState::Off);
            }
            _ => {
                if !process_state.completed_normally() {
                    tracing::warn!(
                        name = %self.name,
                        "QEMU exited: {}",
                        process_state.failure_message()
                    );
                }
                self.monitor.on_shutdown();
                self.set_state_locked(&mut shared, VmState::Off);
            }
        }
    }

    /// A broken QMP channel is fatal: the child is no longer
    /// controllable, so it is killed and the exit path takes over.
    fn handle_session_broken(&self, reason: &str) {
        tracing::error!(name = %self.name, "QMP session broken: {reason}");
        let session = self.shared.lock().unwrap().session.clone();
        if let Some(session) = session {
            session.kill();
        }
    }
}

#[cfg(test)]
#[path = "vm_tests.rs"]
mod vm_tests;
