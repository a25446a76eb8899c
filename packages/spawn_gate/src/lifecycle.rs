//! Per-process state machine: spawn matching, attach, inject, resume, detach.
//!
//! Everything here runs on the reactor's execution context. Collaborator
//! callbacks never touch this state directly; they only schedule a [`Task`].

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use task_reactor::{ReactorHandle, RunStats, TaskHandler};
use tracing::{debug, error, info, warn};

use crate::controller::{ControllerConfig, RunSummary, ScriptFailurePolicy, UnmatchedSpawnPolicy};
use crate::device::{DetachReason, Device, DeviceEvent, Pid, ScriptMessage, SpawnInfo};
use crate::error::{ControllerError, DeviceError, InstrumentError};
use crate::idle::{IdlePolicy, IdleVerdict};
use crate::registry::{SessionId, SessionRegistry};
use crate::report::{Report, Reporter};

/// Work items processed by the controller, one at a time
#[derive(Debug)]
pub(crate) enum Task {
    Start,
    Device(DeviceEvent),
    Detached {
        pid: Pid,
        session: SessionId,
        reason: DetachReason,
    },
    Message {
        pid: Pid,
        message: ScriptMessage,
        data: Option<Vec<u8>>,
    },
    StopIfIdle,
}

pub(crate) struct Lifecycle {
    device: Arc<dyn Device>,
    config: ControllerConfig,
    idle: IdlePolicy,
    registry: SessionRegistry,
    /// Non-matching spawns left gated
    held: BTreeSet<Pid>,
    reporter: Reporter,
    instrumented: usize,
    failures: usize,
    fatal: Option<ControllerError>,
}

impl TaskHandler<Task> for Lifecycle {
    type Error = ControllerError;

    fn handle(&mut self, task: Task, reactor: &ReactorHandle<Task>) -> Result<(), ControllerError> {
        match task {
            Task::Start => self.start(reactor),
            Task::Device(event) => self.on_device_event(event, reactor),
            Task::Detached {
                pid,
                session,
                reason,
            } => return self.on_detached(pid, session, reason, reactor),
            Task::Message { pid, message, data } => self.on_message(pid, &message, data),
            Task::StopIfIdle => self.stop_if_idle(reactor),
        }
        Ok(())
    }
}

impl Lifecycle {
    pub(crate) fn new(
        device: Arc<dyn Device>,
        config: ControllerConfig,
        reporter: Reporter,
    ) -> Self {
        Self {
            device,
            idle: IdlePolicy::new(config.debounce),
            config,
            registry: SessionRegistry::new(),
            held: BTreeSet::new(),
            reporter,
            instrumented: 0,
            failures: 0,
            fatal: None,
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.config.target
    }

    /// Close out the run. A fatal startup error wins over the stats.
    pub(crate) fn finish(mut self, stats: RunStats) -> Result<RunSummary, ControllerError> {
        if let Some(err) = self.fatal.take() {
            return Err(err);
        }
        Ok(RunSummary {
            stats,
            instrumented: self.instrumented,
            failures: self.failures,
            attached: self.registry.pids(),
            held: self.held.iter().copied().collect(),
        })
    }

    fn start(&mut self, reactor: &ReactorHandle<Task>) {
        info!("Starting {}", self.config.target);
        self.reporter.emit(Report::Started {
            target: self.config.target.clone(),
        });

        let sink = reactor.clone();
        self.device
            .on_event(Box::new(move |event| sink.schedule(Task::Device(event))));

        if let Err(source) = self.device.enable_spawn_gating() {
            self.abort(reactor, "enable spawn gating", source);
            return;
        }

        let pid = match self.device.spawn(&self.config.target) {
            Ok(pid) => pid,
            Err(source) => {
                self.abort(reactor, "spawn target", source);
                return;
            }
        };
        info!(%pid, "Spawned {}", self.config.target);
        self.instrument_or_report(pid, reactor);
    }

    fn abort(&mut self, reactor: &ReactorHandle<Task>, context: &'static str, source: DeviceError) {
        error!("Cannot {}: {}", context, source);
        self.fatal = Some(ControllerError::Startup { context, source });
        reactor.stop();
    }

    fn instrument_or_report(&mut self, pid: Pid, reactor: &ReactorHandle<Task>) {
        match self.instrument(pid, reactor) {
            Ok(session) => debug!(%pid, %session, "Instrumented"),
            Err(err) => {
                self.failures += 1;
                self.reporter.emit(Report::InstrumentFailed {
                    pid: err.pid(),
                    code: err.error_code().to_string(),
                    error: err.to_string(),
                });
                // Nothing may be attached now; make sure the run can still end
                self.idle.arm(reactor, Task::StopIfIdle);
            }
        }
    }

    /// attach → inject → resume. The process only runs once the script is in.
    fn instrument(
        &mut self,
        pid: Pid,
        reactor: &ReactorHandle<Task>,
    ) -> Result<SessionId, InstrumentError> {
        self.reporter.emit(Report::Instrumenting { pid });

        let session = self
            .device
            .attach(pid)
            .map_err(|source| InstrumentError::Attach { pid, source })?;

        let (id, live) = self.registry.register(pid, session);
        let sink = reactor.clone();
        live.session.on_detached(Box::new(move |reason| {
            sink.schedule(Task::Detached {
                pid,
                session: id,
                reason,
            })
        }));
        self.reporter.emit(Report::Attached { pid, session: id });

        if let Err(source) = self.inject(id, pid, reactor) {
            self.on_script_failure(id, pid);
            return Err(InstrumentError::ScriptLoad { pid, source });
        }

        self.device
            .resume(pid)
            .map_err(|source| InstrumentError::Resume { pid, source })?;
        self.reporter.emit(Report::Resumed { pid });
        self.instrumented += 1;
        Ok(id)
    }

    fn inject(
        &mut self,
        id: SessionId,
        pid: Pid,
        reactor: &ReactorHandle<Task>,
    ) -> Result<(), DeviceError> {
        let Some(live) = self.registry.get_mut(id) else {
            return Err(DeviceError::InvalidArgument(format!(
                "session {} is not registered",
                id
            )));
        };

        let script = live.session.create_script(&self.config.script_source)?;
        self.reporter.emit(Report::ScriptCreated { pid });

        let sink = reactor.clone();
        script.on_message(Box::new(move |message, data| {
            sink.schedule(Task::Message { pid, message, data })
        }));

        script.load()?;
        self.reporter.emit(Report::ScriptLoaded { pid });

        live.script = Some(script);
        Ok(())
    }

    fn on_script_failure(&mut self, id: SessionId, pid: Pid) {
        match self.config.script_failure {
            ScriptFailurePolicy::Keep => {
                warn!(%pid, "Script failed; session stays attached and the process stays paused");
            }
            ScriptFailurePolicy::Detach => {
                if let Some(live) = self.registry.get(id) {
                    if let Err(e) = live.session.detach() {
                        warn!(%pid, "Failed to detach after script failure: {}", e);
                    }
                }
                match self.device.resume(pid) {
                    Ok(()) => info!(%pid, "Resumed without instrumentation"),
                    Err(e) => warn!(%pid, "Failed to resume after script failure: {}", e),
                }
            }
            ScriptFailurePolicy::Kill => {
                if let Err(e) = self.device.kill(pid) {
                    warn!(%pid, "Failed to kill after script failure: {}", e);
                }
            }
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent, reactor: &ReactorHandle<Task>) {
        match event {
            DeviceEvent::SpawnAdded(spawn) => self.on_spawn_added(spawn, reactor),
            DeviceEvent::SpawnRemoved(spawn) => {
                self.held.remove(&spawn.pid);
                self.reporter.emit(Report::SpawnRemoved { spawn });
            }
            DeviceEvent::ChildAdded(child) => self.reporter.emit(Report::ChildAdded { child }),
            DeviceEvent::ChildRemoved(child) => self.reporter.emit(Report::ChildRemoved { child }),
            DeviceEvent::ProcessCrashed(crash) => self.reporter.emit(Report::Crashed { crash }),
            DeviceEvent::Output(output) => self.reporter.emit(Report::Output {
                pid: output.pid,
                fd: output.fd,
                text: String::from_utf8_lossy(&output.data).into_owned(),
            }),
            DeviceEvent::Uninjected(info) => self.reporter.emit(Report::Uninjected { id: info.id }),
            DeviceEvent::Lost(info) => self.reporter.emit(Report::Lost { pid: info.pid }),
        }
    }

    fn on_spawn_added(&mut self, spawn: SpawnInfo, reactor: &ReactorHandle<Task>) {
        if !spawn.identifier.starts_with(&self.config.target) {
            match self.config.unmatched_spawns {
                UnmatchedSpawnPolicy::Hold => {
                    self.held.insert(spawn.pid);
                    warn!(
                        pid = %spawn.pid,
                        "Leaving {} gated ({} held)",
                        spawn.identifier,
                        self.held.len()
                    );
                }
                UnmatchedSpawnPolicy::Resume => {
                    if let Err(e) = self.device.resume(spawn.pid) {
                        warn!(pid = %spawn.pid, "Failed to resume unmatched spawn: {}", e);
                    }
                }
            }
            let held = self.held.len();
            self.reporter.emit(Report::SpawnIgnored { spawn, held });
            return;
        }

        let pid = spawn.pid;
        self.reporter.emit(Report::SpawnMatched { spawn });
        self.instrument_or_report(pid, reactor);
    }

    fn on_message(&mut self, pid: Pid, message: &ScriptMessage, data: Option<Vec<u8>>) {
        if let Some(data) = &data {
            debug!(%pid, "Message carries {} bytes of data", data.len());
        }
        self.reporter.emit(Report::Message {
            pid,
            payload: message.reported(),
        });
    }

    fn on_detached(
        &mut self,
        pid: Pid,
        id: SessionId,
        reason: DetachReason,
        reactor: &ReactorHandle<Task>,
    ) -> Result<(), ControllerError> {
        let removed = self.registry.remove(id, pid);
        let attached_ms = removed
            .as_ref()
            .ok()
            .map(|live| (Utc::now() - live.attached_at).num_milliseconds());
        self.reporter.emit(Report::Detached {
            pid,
            session: id,
            reason: reason.to_string(),
            attached_ms,
        });

        removed?;
        self.idle.arm(reactor, Task::StopIfIdle);
        Ok(())
    }

    fn stop_if_idle(&mut self, reactor: &ReactorHandle<Task>) {
        if reactor.is_stopped() {
            return;
        }
        match self.idle.evaluate(&self.registry) {
            IdleVerdict::Idle => {
                info!("No sessions left, stopping");
                self.reporter.emit(Report::Idle);
                reactor.stop();
            }
            IdleVerdict::Busy { sessions } => debug!(sessions, "Still instrumenting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Call, FakeDevice};
    use serde_json::json;
    use task_reactor::Reactor;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn lifecycle(device: &FakeDevice, config: ControllerConfig) -> (Lifecycle, UnboundedReceiver<Report>) {
        let reporter = Reporter::new();
        let rx = reporter.subscribe();
        (Lifecycle::new(Arc::new(device.clone()), config, reporter), rx)
    }

    fn config() -> ControllerConfig {
        ControllerConfig::new("com.eg.android.AlipayGphone", "send('hi')")
    }

    fn spawn(pid: u32, identifier: &str) -> Task {
        Task::Device(DeviceEvent::SpawnAdded(SpawnInfo {
            pid: Pid(pid),
            identifier: identifier.to_string(),
        }))
    }

    fn drain(rx: &mut UnboundedReceiver<Report>) -> Vec<Report> {
        let mut out = Vec::new();
        while let Ok(report) = rx.try_recv() {
            out.push(report);
        }
        out
    }

    #[test]
    fn test_start_enables_gating_then_instruments_target() {
        let device = FakeDevice::new();
        let (mut lc, mut rx) = lifecycle(&device, config());
        let reactor = Reactor::new();

        lc.handle(Task::Start, &reactor.handle()).unwrap();

        let pid = FakeDevice::FIRST_PID;
        assert_eq!(
            device.calls(),
            vec![
                Call::EnableGating,
                Call::Spawn("com.eg.android.AlipayGphone".into()),
                Call::Attach(pid),
                Call::CreateScript(pid),
                Call::Load(pid),
                Call::Resume(pid),
            ]
        );
        assert_eq!(lc.registry.len(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                Report::Started {
                    target: "com.eg.android.AlipayGphone".into()
                },
                Report::Instrumenting { pid },
                Report::Attached {
                    pid,
                    session: SessionId(1)
                },
                Report::ScriptCreated { pid },
                Report::ScriptLoaded { pid },
                Report::Resumed { pid },
            ]
        );
    }

    #[test]
    fn test_spawn_filter_uses_target_prefix() {
        let device = FakeDevice::new();
        let (mut lc, mut rx) = lifecycle(&device, config());
        let handle = Reactor::new().handle();

        lc.handle(spawn(20, "com.eg.android.AlipayGphone:push"), &handle)
            .unwrap();
        lc.handle(spawn(21, "com.other.app"), &handle).unwrap();

        let calls = device.calls();
        assert!(calls.contains(&Call::Attach(Pid(20))));
        assert!(!calls.contains(&Call::Attach(Pid(21))));
        // Left gated
        assert!(!calls.contains(&Call::Resume(Pid(21))));
        assert!(drain(&mut rx).contains(&Report::SpawnIgnored {
            spawn: SpawnInfo {
                pid: Pid(21),
                identifier: "com.other.app".into()
            },
            held: 1
        }));
        assert_eq!(lc.held.iter().copied().collect::<Vec<_>>(), vec![Pid(21)]);
    }

    #[test]
    fn test_spawn_removed_releases_held_spawn() {
        let device = FakeDevice::new();
        let (mut lc, _rx) = lifecycle(&device, config());
        let handle = Reactor::new().handle();

        lc.handle(spawn(21, "com.other.app"), &handle).unwrap();
        lc.handle(
            Task::Device(DeviceEvent::SpawnRemoved(SpawnInfo {
                pid: Pid(21),
                identifier: "com.other.app".into(),
            })),
            &handle,
        )
        .unwrap();

        assert!(lc.held.is_empty());
    }

    #[test]
    fn test_unmatched_spawns_can_be_resumed() {
        let device = FakeDevice::new();
        let mut config = config();
        config.unmatched_spawns = UnmatchedSpawnPolicy::Resume;
        let (mut lc, _rx) = lifecycle(&device, config);

        lc.handle(spawn(30, "com.other.app"), &Reactor::new().handle())
            .unwrap();

        assert_eq!(device.calls(), vec![Call::Resume(Pid(30))]);
        assert!(lc.held.is_empty());
    }

    #[test]
    fn test_resume_never_happens_when_load_fails() {
        let device = FakeDevice::new();
        device.fail_load(Pid(40));
        let (mut lc, mut rx) = lifecycle(&device, config());

        lc.handle(spawn(40, "com.eg.android.AlipayGphone"), &Reactor::new().handle())
            .unwrap();

        let calls = device.calls();
        assert!(calls.contains(&Call::Load(Pid(40))));
        assert!(!calls.contains(&Call::Resume(Pid(40))));
        // Keep policy: the session stays registered, un-instrumented
        assert_eq!(lc.registry.len(), 1);

        let reports = drain(&mut rx);
        assert!(reports.iter().any(|r| matches!(
            r,
            Report::InstrumentFailed { pid: Pid(40), code, .. } if code == "script_load_failed"
        )));
        assert!(!reports.contains(&Report::Resumed { pid: Pid(40) }));
    }

    #[test]
    fn test_script_failure_detach_policy_resumes_uninstrumented() {
        let device = FakeDevice::new();
        device.fail_create_script(Pid(41));
        let mut config = config();
        config.script_failure = ScriptFailurePolicy::Detach;
        let (mut lc, _rx) = lifecycle(&device, config);

        lc.handle(spawn(41, "com.eg.android.AlipayGphone"), &Reactor::new().handle())
            .unwrap();

        let calls = device.calls();
        let detach = calls.iter().position(|c| *c == Call::Detach(Pid(41)));
        let resume = calls.iter().position(|c| *c == Call::Resume(Pid(41)));
        assert!(detach.is_some());
        assert!(detach < resume);
        assert!(!calls.contains(&Call::Load(Pid(41))));
    }

    #[test]
    fn test_script_failure_kill_policy() {
        let device = FakeDevice::new();
        device.fail_load(Pid(42));
        let mut config = config();
        config.script_failure = ScriptFailurePolicy::Kill;
        let (mut lc, _rx) = lifecycle(&device, config);

        lc.handle(spawn(42, "com.eg.android.AlipayGphone"), &Reactor::new().handle())
            .unwrap();

        let calls = device.calls();
        assert!(calls.contains(&Call::Kill(Pid(42))));
        assert!(!calls.contains(&Call::Resume(Pid(42))));
    }

    #[test]
    fn test_registry_tracks_attach_and_detach() {
        let device = FakeDevice::new();
        device.fail_attach(Pid(51));
        let (mut lc, _rx) = lifecycle(&device, config());
        let handle = Reactor::new().handle();

        lc.handle(spawn(50, "com.eg.android.AlipayGphone"), &handle).unwrap();
        lc.handle(spawn(51, "com.eg.android.AlipayGphone"), &handle).unwrap();
        lc.handle(spawn(52, "com.eg.android.AlipayGphone"), &handle).unwrap();
        assert_eq!(lc.registry.len(), 2);
        assert_eq!(lc.registry.pids(), vec![Pid(50), Pid(52)]);

        lc.handle(
            Task::Detached {
                pid: Pid(50),
                session: SessionId(1),
                reason: DetachReason::ProcessTerminated,
            },
            &handle,
        )
        .unwrap();
        assert_eq!(lc.registry.pids(), vec![Pid(52)]);
    }

    #[test]
    fn test_detach_of_unknown_session_is_surfaced() {
        let device = FakeDevice::new();
        let (mut lc, mut rx) = lifecycle(&device, config());

        let err = lc
            .handle(
                Task::Detached {
                    pid: Pid(60),
                    session: SessionId(99),
                    reason: DetachReason::Other("manual kill".into()),
                },
                &Reactor::new().handle(),
            )
            .unwrap_err();

        assert!(matches!(err, ControllerError::Registry(_)));
        // Still reported once
        assert_eq!(
            drain(&mut rx),
            vec![Report::Detached {
                pid: Pid(60),
                session: SessionId(99),
                reason: "manual kill".into(),
                attached_ms: None,
            }]
        );
    }

    #[test]
    fn test_message_classification() {
        let device = FakeDevice::new();
        let (mut lc, mut rx) = lifecycle(&device, config());
        let handle = Reactor::new().handle();

        let send: ScriptMessage =
            serde_json::from_value(json!({"type": "send", "payload": [1, 2, 3]})).unwrap();
        let error: ScriptMessage =
            serde_json::from_value(json!({"type": "error", "description": "oops", "stack": "s"}))
                .unwrap();

        lc.handle(
            Task::Message {
                pid: Pid(7),
                message: send,
                data: None,
            },
            &handle,
        )
        .unwrap();
        lc.handle(
            Task::Message {
                pid: Pid(7),
                message: error,
                data: Some(vec![0xde, 0xad]),
            },
            &handle,
        )
        .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                Report::Message {
                    pid: Pid(7),
                    payload: json!([1, 2, 3])
                },
                Report::Message {
                    pid: Pid(7),
                    payload: json!({"type": "error", "description": "oops", "stack": "s"})
                },
            ]
        );
    }

    #[test]
    fn test_stop_if_idle_only_when_empty() {
        let device = FakeDevice::new();
        let (mut lc, mut rx) = lifecycle(&device, config());
        let handle = Reactor::new().handle();

        lc.handle(spawn(70, "com.eg.android.AlipayGphone"), &handle).unwrap();
        lc.handle(Task::StopIfIdle, &handle).unwrap();
        assert!(!handle.is_stopped());

        lc.handle(
            Task::Detached {
                pid: Pid(70),
                session: SessionId(1),
                reason: DetachReason::ProcessTerminated,
            },
            &handle,
        )
        .unwrap();
        drain(&mut rx);

        lc.handle(Task::StopIfIdle, &handle).unwrap();
        lc.handle(Task::StopIfIdle, &handle).unwrap();
        assert!(handle.is_stopped());
        assert_eq!(drain(&mut rx), vec![Report::Idle]);
    }

    #[test]
    fn test_startup_failure_is_fatal() {
        let device = FakeDevice::new();
        device.fail_gating();
        let (mut lc, _rx) = lifecycle(&device, config());
        let handle = Reactor::new().handle();

        lc.handle(Task::Start, &handle).unwrap();

        assert!(handle.is_stopped());
        assert!(!device.calls().iter().any(|c| matches!(c, Call::Spawn(_))));
        assert!(matches!(
            lc.finish(RunStats::default()),
            Err(ControllerError::Startup {
                context: "enable spawn gating",
                ..
            })
        ));
    }
}
