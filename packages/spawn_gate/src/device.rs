//! Collaborator seams: the device that gates and attaches to processes, the
//! sessions it hands out, and the scripts loaded into them.
//!
//! Callbacks registered here may be invoked from any thread. Implementations
//! must not assume they run on the controller's execution context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::DeviceError;

/// Callback invoked by a collaborator when an event fires
pub type Handler<E> = Box<dyn Fn(E) + Send + Sync>;

/// Callback for script messages: the message plus an optional binary blob
pub type MessageHandler = Box<dyn Fn(ScriptMessage, Option<Vec<u8>>) + Send + Sync>;

/// OS process id on the device
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A newly created, paused process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnInfo {
    pub pid: Pid,
    /// Package / bundle name or program path
    pub identifier: String,
}

/// A child process observed by the device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildInfo {
    pub pid: Pid,
    pub parent_pid: Pid,
    /// How the child came to be, e.g. "fork", "exec", "spawn"
    pub origin: String,
    pub identifier: Option<String>,
    pub path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashInfo {
    pub pid: Pid,
    pub process_name: String,
    pub summary: String,
    pub report: Option<String>,
}

/// Bytes a spawned process wrote to one of its standard streams
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    pub pid: Pid,
    pub fd: i32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninjectedInfo {
    pub id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostInfo {
    pub pid: Option<Pid>,
}

/// Events a device reports about processes it can see
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    SpawnAdded(SpawnInfo),
    SpawnRemoved(SpawnInfo),
    ChildAdded(ChildInfo),
    ChildRemoved(ChildInfo),
    ProcessCrashed(CrashInfo),
    Output(OutputInfo),
    Uninjected(UninjectedInfo),
    Lost(LostInfo),
}

/// Why a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetachReason {
    ApplicationRequested,
    ProcessReplaced,
    ProcessTerminated,
    ConnectionTerminated,
    DeviceLost,
    Other(String),
}

impl DetachReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ApplicationRequested => "application-requested",
            Self::ProcessReplaced => "process-replaced",
            Self::ProcessTerminated => "process-terminated",
            Self::ConnectionTerminated => "connection-terminated",
            Self::DeviceLost => "device-lost",
            Self::Other(reason) => reason,
        }
    }
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for DetachReason {
    fn from(reason: &str) -> Self {
        match reason {
            "application-requested" => Self::ApplicationRequested,
            "process-replaced" => Self::ProcessReplaced,
            "process-terminated" => Self::ProcessTerminated,
            "connection-terminated" => Self::ConnectionTerminated,
            "device-lost" => Self::DeviceLost,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A message posted by a running script.
///
/// Every message has a `type`; the remaining fields depend on it. `send`
/// messages carry a `payload`, `error` messages a `description` and usually a
/// `stack`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ScriptMessage {
    pub fn send(payload: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("payload".to_string(), payload.into());
        Self {
            kind: "send".to_string(),
            fields,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(
            "description".to_string(),
            Value::String(description.into()),
        );
        Self {
            kind: "error".to_string(),
            fields,
        }
    }

    pub fn is_send(&self) -> bool {
        self.kind == "send"
    }

    /// What gets reported for this message: the bare payload of a `send`,
    /// the whole message for anything else.
    pub fn reported(&self) -> Value {
        if self.is_send() {
            self.fields.get("payload").cloned().unwrap_or(Value::Null)
        } else {
            let mut full = self.fields.clone();
            full.insert("type".to_string(), Value::String(self.kind.clone()));
            Value::Object(full)
        }
    }
}

/// A device able to gate spawns and attach to processes.
pub trait Device: Send + Sync {
    /// Register the sink for every device event. Replaces any earlier sink.
    fn on_event(&self, handler: Handler<DeviceEvent>);

    /// Pause every new process right after creation until it is resumed.
    fn enable_spawn_gating(&self) -> Result<(), DeviceError>;

    /// Launch `identifier` paused and return its pid.
    fn spawn(&self, identifier: &str) -> Result<Pid, DeviceError>;

    fn resume(&self, pid: Pid) -> Result<(), DeviceError>;

    fn kill(&self, pid: Pid) -> Result<(), DeviceError>;

    fn attach(&self, pid: Pid) -> Result<Box<dyn Session>, DeviceError>;
}

/// An instrumentation attachment to one process
pub trait Session: Send + Sync {
    fn pid(&self) -> Pid;

    /// Register the detach callback. Fires at most once per session.
    fn on_detached(&self, handler: Handler<DetachReason>);

    /// Compile `source` into a script bound to this session.
    fn create_script(&self, source: &str) -> Result<Box<dyn Script>, DeviceError>;

    fn detach(&self) -> Result<(), DeviceError>;
}

/// Instrumentation code living inside an attached process
pub trait Script: Send + Sync {
    fn on_message(&self, handler: MessageHandler);

    /// Inject and start the script.
    fn load(&self) -> Result<(), DeviceError>;
}
