use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, info, warn};

use super::script::LocalScript;
use super::{EventHandler, pump_chunks};
use crate::device::{
    CrashInfo, DetachReason, Device, DeviceEvent, Handler, OutputInfo, Pid, Script, Session,
};
use crate::error::DeviceError;

/// Stops the shell before it execs the target, so the pid exists but none of
/// the target's code has run yet.
const GATE_SHIM: &str = r#"kill -STOP $$; exec "$0" "$@""#;

type DetachHandler = Arc<dyn Fn(DetachReason) + Send + Sync>;

struct TrackedProcess {
    identifier: String,
    sessions: Vec<(u64, DetachHandler)>,
}

#[derive(Default)]
struct DeviceState {
    handlers: Vec<EventHandler>,
    processes: HashMap<Pid, TrackedProcess>,
    next_session: u64,
}

struct Shared {
    args: Vec<String>,
    state: Mutex<DeviceState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: DeviceEvent) {
        let handlers = self.lock().handlers.clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn reap(&self, pid: Pid, status: ExitStatus) {
        let Some(tracked) = self.lock().processes.remove(&pid) else {
            return;
        };

        match status.signal() {
            Some(signal) => {
                let name = Signal::try_from(signal)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| signal.to_string());
                self.emit(DeviceEvent::ProcessCrashed(CrashInfo {
                    pid,
                    process_name: tracked.identifier,
                    summary: format!("terminated by {}", name),
                    report: None,
                }));
            }
            None => debug!(%pid, "Process exited: {}", status),
        }

        for (_, handler) in tracked.sessions {
            handler(DetachReason::ProcessTerminated);
        }
    }

    fn end_session(&self, pid: Pid, session: u64) -> Vec<DetachHandler> {
        let mut state = self.lock();
        let Some(tracked) = state.processes.get_mut(&pid) else {
            return Vec::new();
        };
        let (ended, kept): (Vec<_>, Vec<_>) = tracked
            .sessions
            .drain(..)
            .partition(|(id, _)| *id == session);
        tracked.sessions = kept;
        ended.into_iter().map(|(_, handler)| handler).collect()
    }
}

/// Gates processes it spawns itself, using job-control signals.
#[derive(Clone)]
pub struct LocalDevice {
    shared: Arc<Shared>,
}

impl LocalDevice {
    /// `args` are appended to every spawned target's command line
    pub fn new(args: Vec<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                args,
                state: Mutex::new(DeviceState::default()),
            }),
        }
    }
}

fn raw_pid(pid: Pid) -> nix::unistd::Pid {
    nix::unistd::Pid::from_raw(pid.0 as i32)
}

fn signal(pid: Pid, signal: Signal) -> Result<(), DeviceError> {
    kill(raw_pid(pid), signal).map_err(|errno| match errno {
        Errno::ESRCH => DeviceError::ProcessNotFound(pid),
        Errno::EPERM => DeviceError::PermissionDenied(format!("cannot signal pid {}", pid)),
        other => DeviceError::Io(other.into()),
    })
}

/// Block until the freshly spawned shell has stopped itself
fn wait_until_stopped(pid: Pid) -> Result<(), DeviceError> {
    loop {
        match waitpid(raw_pid(pid), Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Stopped(..)) => return Ok(()),
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(DeviceError::Transport(format!(
                    "pid {} exited with status {} before it was gated",
                    pid, code
                )));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Err(DeviceError::Transport(format!(
                    "pid {} was killed by {} before it was gated",
                    pid,
                    signal.as_str()
                )));
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(errno) => return Err(DeviceError::Io(errno.into())),
        }
    }
}

impl Device for LocalDevice {
    fn on_event(&self, handler: Handler<DeviceEvent>) {
        self.shared.lock().handlers.push(Arc::from(handler));
    }

    fn enable_spawn_gating(&self) -> Result<(), DeviceError> {
        info!("Local spawns are always gated; foreign spawns are not observed");
        Ok(())
    }

    fn spawn(&self, identifier: &str) -> Result<Pid, DeviceError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(GATE_SHIM)
            .arg(identifier)
            .args(&self.shared.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = Pid(child.id());

        if let Err(e) = wait_until_stopped(pid) {
            // Already reaped when it exited on its own
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        self.shared.lock().processes.insert(
            pid,
            TrackedProcess {
                identifier: identifier.to_string(),
                sessions: Vec::new(),
            },
        );

        for (fd, stream) in [
            (1, child.stdout.take().map(|s| Box::new(s) as Box<dyn std::io::Read + Send>)),
            (2, child.stderr.take().map(|s| Box::new(s) as Box<dyn std::io::Read + Send>)),
        ] {
            let Some(stream) = stream else { continue };
            let shared = self.shared.clone();
            thread::Builder::new()
                .name(format!("output-{}-{}", pid, fd))
                .spawn(move || {
                    pump_chunks(stream, |data| {
                        shared.emit(DeviceEvent::Output(OutputInfo { pid, fd, data }))
                    })
                })?;
        }

        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("reap-{}", pid))
            .spawn(move || match child.wait() {
                Ok(status) => shared.reap(pid, status),
                Err(e) => warn!(%pid, "Failed to wait for process: {}", e),
            })?;

        info!(%pid, "Spawned {} (gated)", identifier);
        Ok(pid)
    }

    fn resume(&self, pid: Pid) -> Result<(), DeviceError> {
        signal(pid, Signal::SIGCONT)
    }

    fn kill(&self, pid: Pid) -> Result<(), DeviceError> {
        signal(pid, Signal::SIGKILL)
    }

    fn attach(&self, pid: Pid) -> Result<Box<dyn Session>, DeviceError> {
        let mut state = self.shared.lock();
        if !state.processes.contains_key(&pid) {
            return Err(DeviceError::ProcessNotFound(pid));
        }
        state.next_session += 1;
        Ok(Box::new(LocalSession {
            shared: self.shared.clone(),
            id: state.next_session,
            pid,
        }))
    }
}

struct LocalSession {
    shared: Arc<Shared>,
    id: u64,
    pid: Pid,
}

impl Session for LocalSession {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn on_detached(&self, handler: Handler<DetachReason>) {
        let handler: DetachHandler = Arc::from(handler);
        {
            let mut state = self.shared.lock();
            if let Some(tracked) = state.processes.get_mut(&self.pid) {
                tracked.sessions.push((self.id, handler));
                return;
            }
        }
        // Process is already gone
        handler(DetachReason::ProcessTerminated);
    }

    fn create_script(&self, source: &str) -> Result<Box<dyn Script>, DeviceError> {
        Ok(Box::new(LocalScript::create(self.pid, source)?))
    }

    fn detach(&self) -> Result<(), DeviceError> {
        for handler in self.shared.end_session(self.pid, self.id) {
            handler(DetachReason::ApplicationRequested);
        }
        Ok(())
    }
}
