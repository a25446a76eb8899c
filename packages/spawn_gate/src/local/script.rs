use serde_json::Value;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::debug;

use super::pump_lines;
use crate::device::{MessageHandler, Pid, Script, ScriptMessage};
use crate::error::DeviceError;

type SharedMessageHandler = Arc<dyn Fn(ScriptMessage, Option<Vec<u8>>) + Send + Sync>;

/// Turn one line of script stdout into a message.
///
/// A JSON object with a string `type` is taken as-is; anything else is sent
/// as a plain-text payload.
pub fn classify_line(line: &str) -> ScriptMessage {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(line) {
        if value.get("type").is_some_and(Value::is_string) {
            if let Ok(message) = serde_json::from_value(value) {
                return message;
            }
        }
    }
    ScriptMessage::send(line)
}

#[derive(Default)]
struct ScriptState {
    handler: Option<SharedMessageHandler>,
    child: Option<Child>,
}

/// A shell program running next to the process it was created for.
///
/// Killed when dropped.
pub(super) struct LocalScript {
    pid: Pid,
    source: String,
    state: Mutex<ScriptState>,
}

impl LocalScript {
    /// Syntax-check `source` without running it
    pub(super) fn create(pid: Pid, source: &str) -> Result<Self, DeviceError> {
        let check = Command::new("sh")
            .arg("-n")
            .arg("-c")
            .arg(source)
            .stdin(Stdio::null())
            .output()?;
        if !check.status.success() {
            let stderr = String::from_utf8_lossy(&check.stderr).trim().to_string();
            return Err(DeviceError::Script(if stderr.is_empty() {
                format!("syntax check failed with {}", check.status)
            } else {
                stderr
            }));
        }

        Ok(Self {
            pid,
            source: source.to_string(),
            state: Mutex::new(ScriptState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn deliver(handler: &Option<SharedMessageHandler>, message: ScriptMessage) {
    match handler {
        Some(handler) => handler(message, None),
        None => debug!("Dropping script message with no handler: {}", message.kind),
    }
}

impl Script for LocalScript {
    fn on_message(&self, handler: MessageHandler) {
        self.lock().handler = Some(Arc::from(handler));
    }

    fn load(&self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.child.is_some() {
            return Err(DeviceError::InvalidArgument(
                "script is already loaded".to_string(),
            ));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.source)
            .env("SPAWN_GATE_PID", self.pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let handler = state.handler.clone();
            thread::Builder::new()
                .name(format!("script-out-{}", self.pid))
                .spawn(move || pump_lines(stdout, |line| deliver(&handler, classify_line(&line))))?;
        }
        if let Some(stderr) = child.stderr.take() {
            let handler = state.handler.clone();
            thread::Builder::new()
                .name(format!("script-err-{}", self.pid))
                .spawn(move || {
                    pump_lines(stderr, |line| deliver(&handler, ScriptMessage::error(line)))
                })?;
        }

        debug!(pid = %self.pid, script_pid = child.id(), "Script loaded");
        state.child = Some(child);
        Ok(())
    }
}

impl Drop for LocalScript {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(mut child) = state.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
