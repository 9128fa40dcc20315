use super::*;
use crate::instance::VmImage;
use crate::process::testing::{FakeHandle, FakeProcessFactory};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MonitorEvent {
    Persist(VmState),
    Resume,
    Shutdown,
    Suspend,
}

#[derive(Default)]
struct RecordingMonitor {
    events: Mutex<Vec<MonitorEvent>>,
    metadata: Mutex<Value>,
}

impl RecordingMonitor {
    fn with_metadata(metadata: Value) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            metadata: Mutex::new(metadata),
        }
    }

    fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &MonitorEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl VmStatusMonitor for RecordingMonitor {
    fn persist_state_for(&self, _name: &str, state: VmState) {
        self.events
            .lock()
            .unwrap()
            .push(MonitorEvent::Persist(state));
    }

    fn retrieve_metadata_for(&self, _name: &str) -> Value {
        self.metadata.lock().unwrap().clone()
    }

    fn update_metadata_for(&self, _name: &str, metadata: Value) {
        *self.metadata.lock().unwrap() = metadata;
    }

    fn on_resume(&self) {
        self.events.lock().unwrap().push(MonitorEvent::Resume);
    }

    fn on_shutdown(&self) {
        self.events.lock().unwrap().push(MonitorEvent::Shutdown);
    }

    fn on_suspend(&self) {
        self.events.lock().unwrap().push(MonitorEvent::Suspend);
    }
}

#[derive(Default)]
struct StubPlatform {
    ip: Mutex<Option<String>>,
}

impl Platform for StubPlatform {
    fn vm_platform_args(&self, _desc: &VmDescription) -> Vec<String> {
        vec!["-enable-kvm".to_string()]
    }

    fn vmstate_platform_args(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_ip_for(&self, _mac: &str) -> Option<String> {
        self.ip.lock().unwrap().clone()
    }

    fn remove_resources_for(&self, _vm_name: &str) -> Result<()> {
        Ok(())
    }

    fn platform_health_check(&self) -> Result<()> {
        Ok(())
    }

    fn get_directory_name(&self) -> String {
        "qemu".to_string()
    }
}

#[derive(Default)]
struct FakeImageOps {
    tagged: AtomicBool,
    snapshot_deleted: AtomicBool,
    resized_to: Mutex<Option<MemorySize>>,
}

impl ImageOps for FakeImageOps {
    fn has_suspend_snapshot(&self, _image: &Path) -> bool {
        self.tagged.load(Ordering::SeqCst)
    }

    fn delete_suspend_snapshot(&self, _image: &Path) -> Result<()> {
        self.snapshot_deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resize(&self, _image: &Path, new_size: MemorySize) -> Result<()> {
        *self.resized_to.lock().unwrap() = Some(new_size);
        Ok(())
    }
}

struct Fixture {
    vm: QemuVirtualMachine,
    monitor: Arc<RecordingMonitor>,
    platform: Arc<StubPlatform>,
    processes: Arc<FakeProcessFactory>,
    images: Arc<FakeImageOps>,
}

fn description() -> VmDescription {
    VmDescription {
        vm_name: "primary".to_string(),
        num_cores: 2,
        mem_size: "3M".parse().unwrap(),
        disk_space: "5G".parse().unwrap(),
        ssh_username: "ubuntu".to_string(),
        image: VmImage {
            image_path: PathBuf::from("/images/primary.qcow2"),
            kernel_path: None,
            initrd_path: None,
            image_hash: "deadbeef".to_string(),
            release: "jammy".to_string(),
            stream: "release".to_string(),
        },
        cloud_init_iso: PathBuf::from("/images/primary-cloud-init.iso"),
        extra_interfaces: vec![],
        default_mac: "52:54:00:aa:bb:cc".to_string(),
    }
}

fn fixture() -> Fixture {
    fixture_with_monitor(RecordingMonitor::default())
}

fn fixture_with_monitor(monitor: RecordingMonitor) -> Fixture {
    let monitor = Arc::new(monitor);
    let platform = Arc::new(StubPlatform::default());
    let processes = Arc::new(FakeProcessFactory::default());
    let images = Arc::new(FakeImageOps::default());
    let vm = QemuVirtualMachine::new(
        description(),
        Arc::clone(&monitor) as Arc<dyn VmStatusMonitor>,
        Arc::clone(&platform) as Arc<dyn Platform>,
        Arc::clone(&processes) as Arc<dyn ProcessFactory>,
        Arc::clone(&images) as Arc<dyn ImageOps>,
    );
    Fixture {
        vm,
        monitor,
        platform,
        processes,
        images,
    }
}

fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within two seconds");
}

fn wait_for_state(vm: &QemuVirtualMachine, state: VmState) {
    wait_until(|| vm.current_state() == state);
}

/// Drive a freshly started instance to `running` by replaying the QMP
/// greeting and the RESUME event.
fn boot(fix: &Fixture, process_index: usize) -> FakeHandle {
    let handle = fix.processes.handle(process_index);
    handle.feed_stdout_line(r#"{"QMP": {"version": {}, "capabilities": []}}"#);
    handle.feed_stdout_line(r#"{"return": {}}"#);
    handle.feed_stdout_line(r#"{"event": "RESUME", "timestamp": {"seconds": 1}}"#);
    wait_for_state(&fix.vm, VmState::Running);
    handle
}

#[test]
fn test_off_after_creation() {
    let fix = fixture();

    assert_eq!(fix.vm.current_state(), VmState::Off);
    fix.vm.shutdown().unwrap();
    assert_eq!(fix.vm.current_state(), VmState::Off);

    // A no-op shutdown makes no monitor noise.
    assert!(fix.monitor.events().is_empty());
}

#[test]
fn test_start_then_shutdown_event_sequence() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let handle = boot(&fix, 0);

    let shutdown = {
        let vm = fix.vm.clone();
        thread::spawn(move || vm.shutdown())
    };
    wait_until(|| handle.written_stdin().contains("system_powerdown"));
    handle.feed_stdout_line(r#"{"event": "SHUTDOWN", "data": {"guest": true}}"#);
    handle.exit(0);
    shutdown.join().unwrap().unwrap();

    assert_eq!(fix.vm.current_state(), VmState::Off);
    assert_eq!(
        fix.monitor.events(),
        vec![
            MonitorEvent::Persist(VmState::Starting),
            MonitorEvent::Resume,
            MonitorEvent::Persist(VmState::Running),
            MonitorEvent::Persist(VmState::DelayedShutdown),
            MonitorEvent::Shutdown,
            MonitorEvent::Persist(VmState::Off),
        ]
    );
}

#[test]
fn test_start_is_idempotent_while_starting_and_running() {
    let fix = fixture();

    fix.vm.start().unwrap();
    fix.vm.start().unwrap();
    assert_eq!(fix.processes.spawned(), 1);

    boot(&fix, 0);
    fix.vm.start().unwrap();
    assert_eq!(fix.processes.spawned(), 1);
}

#[test]
fn test_suspend_tags_image_and_restart_loads_snapshot() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let handle = boot(&fix, 0);

    let suspend = {
        let vm = fix.vm.clone();
        thread::spawn(move || vm.suspend())
    };
    wait_until(|| handle.written_stdin().contains("savevm suspend"));
    handle.feed_stdout_line(r#"{"event": "RESUME", "timestamp": {"seconds": 2}}"#);
    suspend.join().unwrap().unwrap();

    assert_eq!(fix.vm.current_state(), VmState::Off);
    assert!(handle.was_killed());
    assert_eq!(fix.monitor.count(&MonitorEvent::Resume), 1);
    assert_eq!(fix.monitor.count(&MonitorEvent::Suspend), 1);
    assert_eq!(fix.monitor.count(&MonitorEvent::Shutdown), 0);

    // The next boot resumes from the snapshot.
    fix.vm.start().unwrap();
    let args = &fix.processes.handle(1).spec.args;
    let loadvm = args.iter().position(|a| a == "-loadvm").expect("-loadvm");
    assert_eq!(args[loadvm + 1], "suspend");
    assert!(!args.contains(&"-cdrom".to_string()));

    // Once the resumed boot is running, the snapshot is consumed.
    boot(&fix, 1);
    wait_until(|| fix.images.snapshot_deleted.load(Ordering::SeqCst));
}

#[test]
fn test_construction_over_tagged_image_resumes() {
    let monitor = Arc::new(RecordingMonitor::default());
    let platform = Arc::new(StubPlatform::default());
    let processes = Arc::new(FakeProcessFactory::default());
    let images = Arc::new(FakeImageOps::default());
    images.tagged.store(true, Ordering::SeqCst);

    let vm = QemuVirtualMachine::new(
        description(),
        monitor,
        platform,
        Arc::clone(&processes) as Arc<dyn ProcessFactory>,
        images,
    );

    assert_eq!(vm.current_state(), VmState::Off);
    vm.start().unwrap();
    let args = &processes.handle(0).spec.args;
    assert!(args.contains(&"-loadvm".to_string()));
}

#[test]
fn test_shutdown_while_starting_fails_waiters() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let handle = fix.processes.handle(0);
    handle.feed_stderr("boot failed miserably");
    // Give the dispatcher a moment to absorb the stderr.
    thread::sleep(Duration::from_millis(100));
    handle.set_alive(false);

    fix.vm.shutdown().unwrap();
    assert_eq!(fix.vm.current_state(), VmState::Off);

    let err = fix.vm.ensure_vm_is_running().unwrap_err();
    match err {
        VmError::StartFailure { name, reason } => {
            assert_eq!(name, "primary");
            assert!(reason.contains("shutdown"), "reason: {reason}");
            assert!(reason.contains("starting"), "reason: {reason}");
            assert!(reason.contains("boot failed miserably"), "reason: {reason}");
        }
        other => panic!("expected StartFailure, got {other:?}"),
    }
}

#[test]
fn test_concurrent_waiter_sees_interrupted_start() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let waiter = {
        let vm = fix.vm.clone();
        thread::spawn(move || vm.ensure_vm_is_running())
    };

    let handle = fix.processes.handle(0);
    let shutdown = {
        let vm = fix.vm.clone();
        thread::spawn(move || vm.shutdown())
    };
    wait_until(|| handle.was_killed());
    shutdown.join().unwrap().unwrap();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, VmError::StartFailure { name, .. } if name == "primary"));
    assert_eq!(fix.vm.current_state(), VmState::Off);
}

#[test]
fn test_child_death_during_start_records_stderr() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let handle = fix.processes.handle(0);
    handle.feed_stderr("qemu: could not load PC BIOS");
    thread::sleep(Duration::from_millis(100));
    handle.exit(1);
    wait_for_state(&fix.vm, VmState::Off);

    let err = fix.vm.ensure_vm_is_running().unwrap_err();
    match err {
        VmError::StartFailure { reason, .. } => {
            assert!(reason.contains("exited with code 1"), "reason: {reason}");
            assert!(reason.contains("could not load PC BIOS"), "reason: {reason}");
        }
        other => panic!("expected StartFailure, got {other:?}"),
    }
    assert_eq!(fix.monitor.count(&MonitorEvent::Resume), 0);
}

#[test]
fn test_metadata_arguments_override_argv() {
    let fix = fixture_with_monitor(RecordingMonitor::with_metadata(
        json!({ "arguments": ["-hi_there", "-hows_it_going"] }),
    ));

    fix.vm.start().unwrap();

    let args = &fix.processes.handle(0).spec.args;
    assert_eq!(args, &vec!["-hi_there".to_string(), "-hows_it_going".to_string()]);
    assert!(!args.contains(&"-nographic".to_string()));
}

#[test]
fn test_suspend_records_machine_type_metadata() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let handle = boot(&fix, 0);

    let suspend = {
        let vm = fix.vm.clone();
        thread::spawn(move || vm.suspend())
    };
    wait_until(|| handle.written_stdin().contains("savevm"));
    handle.feed_stdout_line(r#"{"event": "RESUME", "timestamp": {"seconds": 2}}"#);
    suspend.join().unwrap().unwrap();

    let metadata = fix.monitor.retrieve_metadata_for("primary");
    assert_eq!(
        metadata[METADATA_MACHINE_TYPE],
        Value::String(config::default_machine_type().to_string())
    );
}

#[test]
fn test_ssh_hostname_times_out_into_unknown() {
    let fix = fixture();

    fix.vm.start().unwrap();
    boot(&fix, 0);

    assert_eq!(fix.vm.management_ipv4(), UNKNOWN_IP);

    let err = fix.vm.ssh_hostname(Duration::from_millis(150)).unwrap_err();
    assert!(matches!(err, VmError::Timeout { .. }));
    assert_eq!(fix.vm.current_state(), VmState::Unknown);

    // Starting from unknown is not a valid transition.
    assert!(matches!(
        fix.vm.start(),
        Err(VmError::InvalidStateTransition { .. })
    ));
}

#[test]
fn test_ssh_hostname_returns_lease() {
    let fix = fixture();

    fix.vm.start().unwrap();
    boot(&fix, 0);

    *fix.platform.ip.lock().unwrap() = Some("10.122.17.5".to_string());
    let ip = fix.vm.ssh_hostname(Duration::from_secs(1)).unwrap();
    assert_eq!(ip, "10.122.17.5");
    assert_eq!(fix.vm.management_ipv4(), "10.122.17.5");
    assert_eq!(fix.vm.current_state(), VmState::Running);
}

#[test]
fn test_resizes_are_grow_only_and_stopped_only() {
    let fix = fixture();

    // Shrinking is rejected.
    assert!(matches!(
        fix.vm.update_cpus(1),
        Err(VmError::InvalidSetting { .. })
    ));
    assert!(matches!(
        fix.vm.resize_memory("1M".parse().unwrap()),
        Err(VmError::InvalidSetting { .. })
    ));
    assert!(matches!(
        fix.vm.resize_disk("1G".parse().unwrap()),
        Err(VmError::InvalidSetting { .. })
    ));

    // Equal is a quiet no-op.
    fix.vm.update_cpus(2).unwrap();
    assert_eq!(fix.vm.num_cores(), 2);

    // Growing sticks.
    fix.vm.update_cpus(4).unwrap();
    assert_eq!(fix.vm.num_cores(), 4);
    fix.vm.resize_memory("8M".parse().unwrap()).unwrap();
    assert_eq!(fix.vm.mem_size(), "8M".parse().unwrap());
    fix.vm.resize_disk("10G".parse().unwrap()).unwrap();
    assert_eq!(fix.vm.disk_space(), "10G".parse().unwrap());
    assert_eq!(
        *fix.images.resized_to.lock().unwrap(),
        Some("10G".parse().unwrap())
    );

    // Never while the instance is up.
    fix.vm.start().unwrap();
    boot(&fix, 0);
    assert!(matches!(
        fix.vm.update_cpus(8),
        Err(VmError::InvalidStateTransition { .. })
    ));
}

#[test]
fn test_shutdown_from_unknown_probes_before_powerdown() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let handle = boot(&fix, 0);
    let _ = fix.vm.ssh_hostname(Duration::from_millis(100)).unwrap_err();
    assert_eq!(fix.vm.current_state(), VmState::Unknown);

    let shutdown = {
        let vm = fix.vm.clone();
        thread::spawn(move || vm.shutdown())
    };
    wait_until(|| handle.written_stdin().contains("query-status"));
    handle.feed_stdout_line(r#"{"return": {"status": "running", "running": true}}"#);
    wait_until(|| handle.written_stdin().contains("system_powerdown"));
    handle.exit(0);

    shutdown.join().unwrap().unwrap();
    assert_eq!(fix.vm.current_state(), VmState::Off);
}

#[test]
fn test_networks_is_not_implemented() {
    let fix = fixture();
    assert!(matches!(
        fix.vm.networks(),
        Err(VmError::NotImplementedOnThisBackend)
    ));
}

#[test]
fn test_persisted_states_follow_the_transition_graph() {
    let fix = fixture();

    fix.vm.start().unwrap();
    let handle = boot(&fix, 0);

    let shutdown = {
        let vm = fix.vm.clone();
        thread::spawn(move || vm.shutdown())
    };
    wait_until(|| handle.written_stdin().contains("system_powerdown"));
    handle.exit(0);
    shutdown.join().unwrap().unwrap();

    let persisted: Vec<VmState> = fix
        .monitor
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MonitorEvent::Persist(state) => Some(state),
            _ => None,
        })
        .collect();

    let valid_edges = [
        (VmState::Off, VmState::Starting),
        (VmState::Starting, VmState::Running),
        (VmState::Starting, VmState::Off),
        (VmState::Running, VmState::DelayedShutdown),
        (VmState::Running, VmState::Suspending),
        (VmState::Running, VmState::Unknown),
        (VmState::DelayedShutdown, VmState::Off),
        (VmState::Suspending, VmState::Off),
        (VmState::Unknown, VmState::Off),
    ];

    let mut previous = VmState::Off;
    for state in persisted {
        assert!(
            valid_edges.contains(&(previous, state)),
            "invalid transition {previous} -> {state}"
        );
        previous = state;
    }
    assert_eq!(previous, VmState::Off);
}
