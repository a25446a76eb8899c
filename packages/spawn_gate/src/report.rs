use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::device::{ChildInfo, CrashInfo, Pid, SpawnInfo};
use crate::registry::SessionId;

/// One observable step of a run, emitted exactly once in processing order
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Report {
    Started {
        target: String,
    },
    SpawnMatched {
        spawn: SpawnInfo,
    },
    /// A spawn that does not match the target. `held` counts spawns left gated.
    SpawnIgnored {
        spawn: SpawnInfo,
        held: usize,
    },
    SpawnRemoved {
        spawn: SpawnInfo,
    },
    Instrumenting {
        pid: Pid,
    },
    Attached {
        pid: Pid,
        session: SessionId,
    },
    ScriptCreated {
        pid: Pid,
    },
    ScriptLoaded {
        pid: Pid,
    },
    Resumed {
        pid: Pid,
    },
    InstrumentFailed {
        pid: Pid,
        code: String,
        error: String,
    },
    ChildAdded {
        child: ChildInfo,
    },
    ChildRemoved {
        child: ChildInfo,
    },
    Crashed {
        crash: CrashInfo,
    },
    Output {
        pid: Pid,
        fd: i32,
        text: String,
    },
    Uninjected {
        id: u32,
    },
    Lost {
        pid: Option<Pid>,
    },
    Message {
        pid: Pid,
        payload: Value,
    },
    Detached {
        pid: Pid,
        session: SessionId,
        reason: String,
        /// How long the session was attached, when known
        attached_ms: Option<i64>,
    },
    Idle,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Started { target } => write!(f, "start {}", target),
            Report::SpawnMatched { spawn } => write!(
                f,
                "spawn added: pid={}, identifier={}",
                spawn.pid, spawn.identifier
            ),
            Report::SpawnIgnored { spawn, held } => write!(
                f,
                "spawn ignored: pid={}, identifier={} ({} held)",
                spawn.pid, spawn.identifier, held
            ),
            Report::SpawnRemoved { spawn } => write!(
                f,
                "spawn removed: pid={}, identifier={}",
                spawn.pid, spawn.identifier
            ),
            Report::Instrumenting { pid } => write!(f, "instrument pid={}", pid),
            Report::Attached { pid, session } => {
                write!(f, "attached: pid={}, session={}", pid, session)
            }
            Report::ScriptCreated { pid } => write!(f, "script created: pid={}", pid),
            Report::ScriptLoaded { pid } => write!(f, "script loaded: pid={}", pid),
            Report::Resumed { pid } => write!(f, "resume(pid={})", pid),
            Report::InstrumentFailed { pid, code, error } => {
                write!(f, "instrument failed: pid={}, {}: {}", pid, code, error)
            }
            Report::ChildAdded { child } => write!(
                f,
                "child added: pid={}, parent={}, origin={}",
                child.pid, child.parent_pid, child.origin
            ),
            Report::ChildRemoved { child } => write!(
                f,
                "child removed: pid={}, parent={}, origin={}",
                child.pid, child.parent_pid, child.origin
            ),
            Report::Crashed { crash } => write!(
                f,
                "process crashed: pid={}, name={}, summary={}",
                crash.pid, crash.process_name, crash.summary
            ),
            Report::Output { pid, fd, text } => {
                write!(f, "output: pid={}, fd={}, data={:?}", pid, fd, text)
            }
            Report::Uninjected { id } => write!(f, "uninjected: id={}", id),
            Report::Lost { pid: Some(pid) } => write!(f, "lost: pid={}", pid),
            Report::Lost { pid: None } => write!(f, "lost: device"),
            Report::Message { pid, payload } => {
                write!(f, "message: pid={}, payload={}", pid, payload)
            }
            Report::Detached { pid, reason, .. } => {
                write!(f, "detached: pid={}, reason='{}'", pid, reason)
            }
            Report::Idle => write!(f, "idle: no sessions left, stopping"),
        }
    }
}

impl Report {
    /// The `event` tag this report serializes with
    pub fn kind(&self) -> &'static str {
        match self {
            Report::Started { .. } => "started",
            Report::SpawnMatched { .. } => "spawn-matched",
            Report::SpawnIgnored { .. } => "spawn-ignored",
            Report::SpawnRemoved { .. } => "spawn-removed",
            Report::Instrumenting { .. } => "instrumenting",
            Report::Attached { .. } => "attached",
            Report::ScriptCreated { .. } => "script-created",
            Report::ScriptLoaded { .. } => "script-loaded",
            Report::Resumed { .. } => "resumed",
            Report::InstrumentFailed { .. } => "instrument-failed",
            Report::ChildAdded { .. } => "child-added",
            Report::ChildRemoved { .. } => "child-removed",
            Report::Crashed { .. } => "crashed",
            Report::Output { .. } => "output",
            Report::Uninjected { .. } => "uninjected",
            Report::Lost { .. } => "lost",
            Report::Message { .. } => "message",
            Report::Detached { .. } => "detached",
            Report::Idle => "idle",
        }
    }

    /// The process this report is about, if any
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Report::SpawnMatched { spawn }
            | Report::SpawnIgnored { spawn, .. }
            | Report::SpawnRemoved { spawn } => Some(spawn.pid),
            Report::ChildAdded { child } | Report::ChildRemoved { child } => Some(child.pid),
            Report::Crashed { crash } => Some(crash.pid),
            Report::Instrumenting { pid }
            | Report::Attached { pid, .. }
            | Report::ScriptCreated { pid }
            | Report::ScriptLoaded { pid }
            | Report::Resumed { pid }
            | Report::InstrumentFailed { pid, .. }
            | Report::Output { pid, .. }
            | Report::Message { pid, .. }
            | Report::Detached { pid, .. } => Some(*pid),
            Report::Lost { pid } => *pid,
            Report::Started { .. } | Report::Uninjected { .. } | Report::Idle => None,
        }
    }
}

/// Fans reports out to subscribers and the log.
///
/// Every subscriber gets its own unbounded queue, so a slow reader never
/// loses reports. Reports go to the log at debug level (warn for failures),
/// so a front end printing the subscription does not see every line twice.
#[derive(Clone, Default)]
pub struct Reporter {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Report>>>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every report emitted from now on. The stream ends once the
    /// last `Reporter` clone is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Report> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, report: Report) {
        let event = report.kind();
        let pid = report.pid().map(|pid| pid.0);
        match &report {
            Report::InstrumentFailed { .. } | Report::Crashed { .. } | Report::Lost { .. } => {
                warn!(event, pid, "{}", report)
            }
            _ => debug!(event, pid, "{}", report),
        }

        let mut subscribers = self.lock();
        // Drop subscribers whose receiver is gone
        subscribers.retain(|tx| tx.send(report.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Report>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
