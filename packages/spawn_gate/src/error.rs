use crate::device::Pid;
use crate::registry::SessionId;

/// Failures reported by a device, session or script collaborator
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("process not found: {0}")]
    ProcessNotFound(Pid),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why instrumenting one process failed. Never aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("attach to pid {pid} failed: {source}")]
    Attach { pid: Pid, source: DeviceError },

    #[error("script load into pid {pid} failed: {source}")]
    ScriptLoad { pid: Pid, source: DeviceError },

    #[error("resume of pid {pid} failed: {source}")]
    Resume { pid: Pid, source: DeviceError },
}

impl InstrumentError {
    pub fn pid(&self) -> Pid {
        match self {
            Self::Attach { pid, .. } | Self::ScriptLoad { pid, .. } | Self::Resume { pid, .. } => {
                *pid
            }
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Attach { .. } => "attach_failed",
            Self::ScriptLoad { .. } => "script_load_failed",
            Self::Resume { .. } => "resume_failed",
        }
    }
}

/// Session bookkeeping went out of step with the device
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session {id} for pid {pid} is not registered")]
    NotRegistered { id: SessionId, pid: Pid },
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("startup failed: {context}: {source}")]
    Startup {
        context: &'static str,
        source: DeviceError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
