use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Depth of the per-process event queue. Readers block when the consumer
/// falls this far behind.
pub const EVENT_QUEUE_DEPTH: usize = 64;

const READ_CHUNK_SIZE: usize = 8192;

/// What to launch: program, argv (without the program name) and extra
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    FailedToStart,
    Crashed,
    Timedout,
    ReadError,
    WriteError,
    UnknownError,
}

#[derive(Debug, Clone)]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub message: String,
}

impl ProcessError {
    pub fn new(kind: ProcessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Terminal state of a supervised process. Exactly one of `exit_code` and
/// `error` is populated.
#[derive(Debug, Clone, Default)]
pub struct ProcessState {
    pub exit_code: Option<i32>,
    pub error: Option<ProcessError>,
}

impl ProcessState {
    pub fn from_exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            error: None,
        }
    }

    pub fn from_error(error: ProcessError) -> Self {
        Self {
            exit_code: None,
            error: Some(error),
        }
    }

    pub fn completed_normally(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn failure_message(&self) -> String {
        match (&self.exit_code, &self.error) {
            (Some(code), _) => format!("process exited with code {code}"),
            (None, Some(err)) => err.message.clone(),
            (None, None) => "process terminated".to_string(),
        }
    }
}

/// Lifecycle and stream notifications emitted by a supervised process,
/// in causal order: `Started` first, `Finished` last.
#[derive(Debug)]
pub enum ProcessEvent {
    Started,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ErrorOccurred(ProcessError),
    Finished(ProcessState),
}

pub type EventSender = SyncSender<ProcessEvent>;

/// An asynchronously supervised child process.
pub trait MonitoredProcess: Send {
    /// Launch the child. Events flow into `events` from background readers;
    /// a launch failure is reported as `ErrorOccurred(FailedToStart)`
    /// followed by `Finished`.
    fn start(&mut self, events: EventSender);

    fn write_stdin(&mut self, data: &[u8]) -> std::io::Result<()>;

    fn running(&self) -> bool;

    /// Force-terminate the child. No-op when not running.
    fn kill(&mut self);

    /// Block until the child has exited, or `timeout` elapses.
    fn wait_for_finished(&self, timeout: Duration) -> Option<ProcessState>;
}

/// Creation seam for supervised processes, so tests can substitute a
/// scripted fake for a real QEMU child.
pub trait ProcessFactory: Send + Sync {
    fn create(&self, spec: ProcessSpec) -> Box<dyn MonitoredProcess>;
}

pub struct HostProcessFactory;

impl ProcessFactory for HostProcessFactory {
    fn create(&self, spec: ProcessSpec) -> Box<dyn MonitoredProcess> {
        Box::new(HostProcess::new(spec))
    }
}

type FinishedSlot = Arc<(Mutex<Option<ProcessState>>, Condvar)>;

/// A child process supervised via reader threads, the production
/// implementation of [`MonitoredProcess`].
pub struct HostProcess {
    spec: ProcessSpec,
    stdin: Option<std::process::ChildStdin>,
    pid: Option<i32>,
    alive: Arc<AtomicBool>,
    finished: FinishedSlot,
}

impl HostProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            stdin: None,
            pid: None,
            alive: Arc::new(AtomicBool::new(false)),
            finished: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn mark_finished(finished: &FinishedSlot, state: ProcessState) {
        let (slot, cv) = &**finished;
        *slot.lock().unwrap() = Some(state);
        cv.notify_all();
    }
}

impl MonitoredProcess for HostProcess {
    fn start(&mut self, events: EventSender) {
        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.spec.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = ProcessError::new(
                    ProcessErrorKind::FailedToStart,
                    format!("failed to launch '{}': {e}", self.spec.program),
                );
                tracing::error!(program = %self.spec.program, "{}", error.message);
                let state = ProcessState::from_error(error.clone());
                Self::mark_finished(&self.finished, state.clone());
                let _ = events.send(ProcessEvent::ErrorOccurred(error));
                let _ = events.send(ProcessEvent::Finished(state));
                return;
            }
        };

        self.pid = Some(child.id() as i32);
        self.stdin = child.stdin.take();
        self.alive.store(true, Ordering::SeqCst);
        let _ = events.send(ProcessEvent::Started);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = spawn_reader(stdout, events.clone(), ProcessEvent::Stdout);
        let stderr_reader = spawn_reader(stderr, events.clone(), ProcessEvent::Stderr);

        let alive = Arc::clone(&self.alive);
        let finished = Arc::clone(&self.finished);
        thread::spawn(move || {
            // Drain both pipes to EOF before reporting the exit, so
            // `Finished` is always the last event delivered.
            stdout_reader.join().ok();
            stderr_reader.join().ok();

            let state = match wait_for_child(&mut child) {
                Ok(status) => match status.code() {
                    Some(code) => ProcessState::from_exit(code),
                    None => ProcessState::from_error(ProcessError::new(
                        ProcessErrorKind::Crashed,
                        match status.signal() {
                            Some(sig) => format!("process terminated by signal {sig}"),
                            None => "process terminated abnormally".to_string(),
                        },
                    )),
                },
                Err(e) => ProcessState::from_error(ProcessError::new(
                    ProcessErrorKind::UnknownError,
                    format!("failed to reap process: {e}"),
                )),
            };

            alive.store(false, Ordering::SeqCst);
            Self::mark_finished(&finished, state.clone());
            let _ = events.send(ProcessEvent::Finished(state));
        });
    }

    fn write_stdin(&mut self, data: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin is not open")
        })?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    fn running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn kill(&mut self) {
        if !self.running() {
            return;
        }
        if let Some(pid) = self.pid {
            tracing::debug!(pid, "sending SIGKILL");
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    fn wait_for_finished(&self, timeout: Duration) -> Option<ProcessState> {
        let (slot, cv) = &*self.finished;
        let deadline = Instant::now() + timeout;
        let mut state = slot.lock().unwrap();
        while state.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next, _) = cv.wait_timeout(state, remaining).unwrap();
            state = next;
        }
        state.clone()
    }
}

fn spawn_reader<R>(
    source: Option<R>,
    events: EventSender,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let Some(mut source) = source else { return };
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if events.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = events.send(ProcessEvent::ErrorOccurred(ProcessError::new(
                        ProcessErrorKind::ReadError,
                        format!("failed to read process output: {e}"),
                    )));
                    break;
                }
            }
        }
    })
}

fn wait_for_child(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    child.wait()
}

/// Captured result of a run-to-completion child.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub state: ProcessState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a child to completion, capturing stdout and stderr in full. The
/// child is killed and reported as `Timedout` if it outlives `timeout`.
pub fn execute(spec: &ProcessSpec, timeout: Duration) -> ProcessOutput {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ProcessOutput {
                state: ProcessState::from_error(ProcessError::new(
                    ProcessErrorKind::FailedToStart,
                    format!("failed to launch '{}': {e}", spec.program),
                )),
                stdout: Vec::new(),
                stderr: Vec::new(),
            }
        }
    };

    let stdout_handle = collect_stream(child.stdout.take());
    let stderr_handle = collect_stream(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let state = loop {
        match child.try_wait() {
            Ok(Some(status)) => match status.code() {
                Some(code) => break ProcessState::from_exit(code),
                None => {
                    break ProcessState::from_error(ProcessError::new(
                        ProcessErrorKind::Crashed,
                        match status.signal() {
                            Some(sig) => format!("process terminated by signal {sig}"),
                            None => "process terminated abnormally".to_string(),
                        },
                    ))
                }
            },
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break ProcessState::from_error(ProcessError::new(
                        ProcessErrorKind::Timedout,
                        format!("'{}' did not finish within {timeout:?}", spec.program),
                    ));
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                break ProcessState::from_error(ProcessError::new(
                    ProcessErrorKind::UnknownError,
                    format!("failed to poll process: {e}"),
                ))
            }
        }
    };

    ProcessOutput {
        state,
        stdout: stdout_handle.join().unwrap_or_default(),
        stderr: stderr_handle.join().unwrap_or_default(),
    }
}

fn collect_stream<R>(source: Option<R>) -> thread::JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut collected = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut collected);
        }
        collected
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_execute_captures_output() {
        let spec = ProcessSpec::new("sh", vec!["-c".into(), "echo out; echo err >&2".into()]);
        let output = execute(&spec, Duration::from_secs(5));

        assert_eq!(output.state.exit_code, Some(0));
        assert!(output.state.completed_normally());
        assert_eq!(output.stdout_utf8(), "out\n");
        assert_eq!(output.stderr_utf8(), "err\n");
    }

    #[test]
    fn test_execute_nonzero_exit() {
        let spec = ProcessSpec::new("sh", vec!["-c".into(), "exit 3".into()]);
        let output = execute(&spec, Duration::from_secs(5));

        assert_eq!(output.state.exit_code, Some(3));
        assert!(!output.state.completed_normally());
    }

    #[test]
    fn test_execute_missing_binary_fails_to_start() {
        let spec = ProcessSpec::new("definitely-not-a-binary-xyzzy", vec![]);
        let output = execute(&spec, Duration::from_secs(5));

        let error = output.state.error.expect("expected a launch error");
        assert_eq!(error.kind, ProcessErrorKind::FailedToStart);
        assert!(output.state.exit_code.is_none());
    }

    #[test]
    fn test_execute_timeout_kills_child() {
        let spec = ProcessSpec::new("sleep", vec!["30".into()]);
        let output = execute(&spec, Duration::from_millis(200));

        let error = output.state.error.expect("expected a timeout error");
        assert_eq!(error.kind, ProcessErrorKind::Timedout);
    }

    #[test]
    fn test_supervised_event_order() {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let mut process =
            HostProcess::new(ProcessSpec::new("sh", vec!["-c".into(), "echo hello".into()]));
        process.start(tx);

        let mut saw_started = false;
        let mut stdout = Vec::new();
        let mut finished = None;
        for event in rx {
            match event {
                ProcessEvent::Started => {
                    assert!(stdout.is_empty(), "output before started");
                    saw_started = true;
                }
                ProcessEvent::Stdout(bytes) => stdout.extend(bytes),
                ProcessEvent::Finished(state) => {
                    finished = Some(state);
                    break;
                }
                _ => {}
            }
        }

        assert!(saw_started);
        assert_eq!(String::from_utf8_lossy(&stdout), "hello\n");
        assert_eq!(finished.unwrap().exit_code, Some(0));
        assert!(!process.running());
    }

    #[test]
    fn test_failed_launch_emits_error_then_finished() {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let mut process = HostProcess::new(ProcessSpec::new("no-such-binary-xyzzy", vec![]));
        process.start(tx);

        let first = rx.recv().unwrap();
        match first {
            ProcessEvent::ErrorOccurred(err) => {
                assert_eq!(err.kind, ProcessErrorKind::FailedToStart)
            }
            other => panic!("expected ErrorOccurred, got {other:?}"),
        }
        let second = rx.recv().unwrap();
        match second {
            ProcessEvent::Finished(state) => assert!(state.error.is_some()),
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn test_kill_terminates_child() {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let mut process = HostProcess::new(ProcessSpec::new("sleep", vec!["30".into()]));
        process.start(tx);

        assert!(process.running());
        process.kill();

        let state = process
            .wait_for_finished(Duration::from_secs(5))
            .expect("child should exit after SIGKILL");
        assert!(state.error.is_some());
        drop(rx);
    }

    #[test]
    fn test_kill_when_not_running_is_noop() {
        let mut process = HostProcess::new(ProcessSpec::new("sleep", vec!["30".into()]));
        process.kill();
        assert!(!process.running());
    }
}
