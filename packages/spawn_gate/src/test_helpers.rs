//! In-memory device for controller tests.
//!
//! Records every collaborator call in order and lets tests fire events from
//! any thread. Handlers are always invoked with the state lock released.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{
    DetachReason, Device, DeviceEvent, Handler, MessageHandler, Pid, Script, ScriptMessage, Session,
};
use crate::error::DeviceError;

type SharedHandler<E> = Arc<dyn Fn(E) + Send + Sync>;
type SharedMessageHandler = Arc<dyn Fn(ScriptMessage, Option<Vec<u8>>) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    EnableGating,
    Spawn(String),
    Resume(Pid),
    Kill(Pid),
    Attach(Pid),
    CreateScript(Pid),
    Load(Pid),
    Detach(Pid),
}

struct DetachHook {
    session: u64,
    pid: Pid,
    handler: SharedHandler<DetachReason>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    next_pid: u32,
    next_session: u64,
    event_handlers: Vec<SharedHandler<DeviceEvent>>,
    detach_hooks: Vec<DetachHook>,
    message_handlers: Vec<(Pid, SharedMessageHandler)>,
    fail_gating: bool,
    fail_spawn: bool,
    fail_attach: HashSet<Pid>,
    fail_create_script: HashSet<Pid>,
    fail_load: HashSet<Pid>,
    fail_resume: HashSet<Pid>,
}

#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub const FIRST_PID: Pid = Pid(1000);

    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn fail_gating(&self) {
        self.lock().fail_gating = true;
    }

    pub fn fail_spawn(&self) {
        self.lock().fail_spawn = true;
    }

    pub fn fail_attach(&self, pid: Pid) {
        self.lock().fail_attach.insert(pid);
    }

    pub fn fail_create_script(&self, pid: Pid) {
        self.lock().fail_create_script.insert(pid);
    }

    pub fn fail_load(&self, pid: Pid) {
        self.lock().fail_load.insert(pid);
    }

    pub fn fail_resume(&self, pid: Pid) {
        self.lock().fail_resume.insert(pid);
    }

    /// Deliver a device event to every registered handler
    pub fn fire(&self, event: DeviceEvent) {
        let handlers = self.lock().event_handlers.clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// End every session attached to `pid`. Each session detaches only once.
    pub fn detach_pid(&self, pid: Pid, reason: DetachReason) {
        let hooks = {
            let mut state = self.lock();
            let (ended, kept): (Vec<_>, Vec<_>) = state
                .detach_hooks
                .drain(..)
                .partition(|hook| hook.pid == pid);
            state.detach_hooks = kept;
            ended
        };
        fire_detached(hooks, reason);
    }

    pub fn post_message(&self, pid: Pid, message: ScriptMessage, data: Option<Vec<u8>>) {
        let handlers: Vec<_> = self
            .lock()
            .message_handlers
            .iter()
            .filter(|(owner, _)| *owner == pid)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(message.clone(), data.clone());
        }
    }

    fn detach_session(&self, session: u64, reason: DetachReason) {
        let hooks = {
            let mut state = self.lock();
            let (ended, kept): (Vec<_>, Vec<_>) = state
                .detach_hooks
                .drain(..)
                .partition(|hook| hook.session == session);
            state.detach_hooks = kept;
            ended
        };
        fire_detached(hooks, reason);
    }
}

fn fire_detached(hooks: Vec<DetachHook>, reason: DetachReason) {
    for hook in hooks {
        (hook.handler)(reason.clone());
    }
}

impl Device for FakeDevice {
    fn on_event(&self, handler: Handler<DeviceEvent>) {
        self.lock().event_handlers.push(Arc::from(handler));
    }

    fn enable_spawn_gating(&self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.calls.push(Call::EnableGating);
        if state.fail_gating {
            return Err(DeviceError::PermissionDenied("spawn gating".into()));
        }
        Ok(())
    }

    fn spawn(&self, identifier: &str) -> Result<Pid, DeviceError> {
        let mut state = self.lock();
        state.calls.push(Call::Spawn(identifier.to_string()));
        if state.fail_spawn {
            return Err(DeviceError::InvalidArgument(format!(
                "unable to find application {}",
                identifier
            )));
        }
        let pid = Pid(Self::FIRST_PID.0 + state.next_pid);
        state.next_pid += 1;
        Ok(pid)
    }

    fn resume(&self, pid: Pid) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.calls.push(Call::Resume(pid));
        if state.fail_resume.contains(&pid) {
            return Err(DeviceError::ProcessNotFound(pid));
        }
        Ok(())
    }

    fn kill(&self, pid: Pid) -> Result<(), DeviceError> {
        self.lock().calls.push(Call::Kill(pid));
        self.detach_pid(pid, DetachReason::ProcessTerminated);
        Ok(())
    }

    fn attach(&self, pid: Pid) -> Result<Box<dyn Session>, DeviceError> {
        let mut state = self.lock();
        state.calls.push(Call::Attach(pid));
        if state.fail_attach.contains(&pid) {
            return Err(DeviceError::ProcessNotFound(pid));
        }
        state.next_session += 1;
        Ok(Box::new(FakeSession {
            device: self.clone(),
            id: state.next_session,
            pid,
        }))
    }
}

struct FakeSession {
    device: FakeDevice,
    id: u64,
    pid: Pid,
}

impl Session for FakeSession {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn on_detached(&self, handler: Handler<DetachReason>) {
        self.device.lock().detach_hooks.push(DetachHook {
            session: self.id,
            pid: self.pid,
            handler: Arc::from(handler),
        });
    }

    fn create_script(&self, _source: &str) -> Result<Box<dyn Script>, DeviceError> {
        let mut state = self.device.lock();
        state.calls.push(Call::CreateScript(self.pid));
        if state.fail_create_script.contains(&self.pid) {
            return Err(DeviceError::Script("script(line 1): SyntaxError".into()));
        }
        Ok(Box::new(FakeScript {
            device: self.device.clone(),
            pid: self.pid,
        }))
    }

    fn detach(&self) -> Result<(), DeviceError> {
        self.device.lock().calls.push(Call::Detach(self.pid));
        self.device
            .detach_session(self.id, DetachReason::ApplicationRequested);
        Ok(())
    }
}

struct FakeScript {
    device: FakeDevice,
    pid: Pid,
}

impl Script for FakeScript {
    fn on_message(&self, handler: MessageHandler) {
        self.device
            .lock()
            .message_handlers
            .push((self.pid, Arc::from(handler)));
    }

    fn load(&self) -> Result<(), DeviceError> {
        let mut state = self.device.lock();
        state.calls.push(Call::Load(self.pid));
        if state.fail_load.contains(&self.pid) {
            return Err(DeviceError::Script("ReferenceError: 'Java' is not defined".into()));
        }
        Ok(())
    }
}
