use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::process::{
    MonitoredProcess, ProcessErrorKind, ProcessEvent, ProcessState, EVENT_QUEUE_DEPTH,
};
use crate::{Result, VmError};

/// Upper bound on a QMP command reply. QEMU answers promptly on a healthy
/// channel; savevm on a large guest is the slow case this has to cover.
pub const QMP_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives QMP events and process lifecycle notifications from the
/// session's dispatcher thread.
pub trait QmpHandler: Send + Sync {
    fn on_event(&self, name: &str, payload: &Value);
    fn on_process_finished(&self, state: ProcessState);
    fn on_session_broken(&self, reason: &str);

    /// The capabilities handshake completed; commands may flow.
    fn on_handshake(&self) {}
}

struct SessionShared {
    process: Mutex<Box<dyn MonitoredProcess>>,
    pending: Mutex<VecDeque<SyncSender<Value>>>,
    broken: AtomicBool,
    stderr: Mutex<Vec<u8>>,
}

/// A QMP conversation over the stdio of one supervised QEMU process.
///
/// Frames one JSON object per line on stdin and consumes line-delimited
/// JSON from stdout. Replies are correlated to commands in FIFO order;
/// asynchronous events go to the [`QmpHandler`].
pub struct QmpSession {
    shared: Arc<SessionShared>,
}

impl QmpSession {
    /// Launch `process` and start dispatching its output. The capabilities
    /// handshake is performed automatically when the greeting arrives.
    pub fn start(mut process: Box<dyn MonitoredProcess>, handler: Arc<dyn QmpHandler>) -> Arc<Self> {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        process.start(tx);

        let shared = Arc::new(SessionShared {
            process: Mutex::new(process),
            pending: Mutex::new(VecDeque::new()),
            broken: AtomicBool::new(false),
            stderr: Mutex::new(Vec::new()),
        });

        let dispatcher_shared = Arc::clone(&shared);
        thread::spawn(move || dispatch_loop(dispatcher_shared, handler, rx));

        Arc::new(Self { shared })
    }

    /// Issue a command and block for its reply, up to
    /// [`QMP_COMMAND_TIMEOUT`]. Returns the `return` payload.
    pub fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(command, arguments, tx)?;

        match rx.recv_timeout(QMP_COMMAND_TIMEOUT) {
            Ok(reply) => {
                if let Some(error) = reply.get("error") {
                    return Err(VmError::Qmp(format!("{command} failed: {error}")));
                }
                Ok(reply.get("return").cloned().unwrap_or(Value::Null))
            }
            Err(RecvTimeoutError::Timeout) => Err(VmError::Timeout {
                operation: format!("QMP {command} reply"),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(VmError::Qmp(format!(
                "QMP channel closed before {command} reply"
            ))),
        }
    }

    /// Issue a command without waiting for its reply. The reply is still
    /// consumed from the FIFO when it arrives.
    pub fn send(&self, command: &str, arguments: Option<Value>) -> Result<()> {
        let (tx, _discard) = mpsc::sync_channel(1);
        self.submit(command, arguments, tx)
    }

    /// Run a human monitor command (`savevm`/`loadvm` and friends) without
    /// waiting for the reply.
    pub fn send_human_monitor_command(&self, command_line: &str) -> Result<()> {
        self.send(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        )
    }

    fn submit(&self, command: &str, arguments: Option<Value>, reply: SyncSender<Value>) -> Result<()> {
        if self.shared.broken.load(Ordering::SeqCst) {
            return Err(VmError::Qmp("QMP session is broken".to_string()));
        }

        let frame = match arguments {
            Some(arguments) => json!({ "execute": command, "arguments": arguments }),
            None => json!({ "execute": command }),
        };

        // The pending queue must match wire order, so the enqueue and the
        // write happen under one lock.
        let mut pending = self.shared.pending.lock().unwrap();
        pending.push_back(reply);
        if let Err(e) = write_frame(&self.shared, &frame) {
            pending.pop_back();
            return Err(e);
        }
        Ok(())
    }

    pub fn running(&self) -> bool {
        self.shared.process.lock().unwrap().running()
    }

    pub fn kill(&self) {
        self.shared.process.lock().unwrap().kill();
    }

    pub fn wait_for_finished(&self, timeout: Duration) -> Option<ProcessState> {
        // Wait in slices so the process mutex is never held for long.
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let slice = Duration::from_millis(50)
                .min(deadline.saturating_duration_since(std::time::Instant::now()));
            let state = self.shared.process.lock().unwrap().wait_for_finished(slice);
            if state.is_some() || std::time::Instant::now() >= deadline {
                return state;
            }
        }
    }

    /// Everything the child wrote to stderr so far.
    pub fn captured_stderr(&self) -> String {
        String::from_utf8_lossy(&self.shared.stderr.lock().unwrap()).into_owned()
    }
}

fn write_frame(shared: &SessionShared, frame: &Value) -> Result<()> {
    let mut line = frame.to_string().into_bytes();
    line.push(b'\n');

    let result = shared.process.lock().unwrap().write_stdin(&line);
    if let Err(e) = result {
        shared.broken.store(true, Ordering::SeqCst);
        return Err(VmError::Qmp(format!("failed to write QMP command: {e}")));
    }
    Ok(())
}

fn dispatch_loop(
    shared: Arc<SessionShared>,
    handler: Arc<dyn QmpHandler>,
    events: mpsc::Receiver<ProcessEvent>,
) {
    let mut line_buffer = String::new();

    for event in events {
        match event {
            ProcessEvent::Started => tracing::trace!("QMP child started"),
            ProcessEvent::Stdout(bytes) => {
                line_buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(newline) = line_buffer.find('\n') {
                    let line: String = line_buffer.drain(..=newline).collect();
                    handle_frame(&shared, handler.as_ref(), line.trim());
                }
            }
            ProcessEvent::Stderr(bytes) => {
                shared.stderr.lock().unwrap().extend_from_slice(&bytes);
            }
            ProcessEvent::ErrorOccurred(error) => match error.kind {
                ProcessErrorKind::ReadError | ProcessErrorKind::WriteError => {
                    shared.broken.store(true, Ordering::SeqCst);
                    handler.on_session_broken(&error.message);
                }
                _ => tracing::debug!(kind = ?error.kind, "process error: {}", error.message),
            },
            ProcessEvent::Finished(state) => {
                // Fail any in-flight commands, then let the owner react.
                shared.pending.lock().unwrap().clear();
                handler.on_process_finished(state);
                break;
            }
        }
    }
}

fn handle_frame(shared: &SessionShared, handler: &dyn QmpHandler, line: &str) {
    if line.is_empty() {
        return;
    }

    let frame: Value = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("discarding malformed QMP frame: {e}");
            return;
        }
    };

    if frame.get("QMP").is_some() {
        // Greeting banner: complete the handshake exactly once. The
        // capabilities reply is consumed by the discarded pending slot.
        let (tx, _discard) = mpsc::sync_channel(1);
        shared.pending.lock().unwrap().push_back(tx);
        if write_frame(shared, &json!({ "execute": "qmp_capabilities" })).is_err() {
            shared.pending.lock().unwrap().pop_back();
            handler.on_session_broken("failed to send qmp_capabilities");
            return;
        }
        handler.on_handshake();
        return;
    }

    if let Some(name) = frame.get("event").and_then(Value::as_str) {
        let payload = frame.get("data").cloned().unwrap_or(Value::Null);
        tracing::debug!(event = name, "QMP event");
        handler.on_event(name, &payload);
        return;
    }

    if frame.get("return").is_some() || frame.get("error").is_some() {
        match shared.pending.lock().unwrap().pop_front() {
            Some(reply) => {
                let _ = reply.send(frame);
            }
            None => tracing::debug!("unmatched QMP reply: {frame}"),
        }
        return;
    }

    tracing::warn!("discarding unrecognized QMP frame: {frame}");
}

#[cfg(test)]
#[path = "qmp_tests.rs"]
mod qmp_tests;
