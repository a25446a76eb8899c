//! Spawn-gating session controller.
//!
//! Spawns a target application paused, and for every gated spawn whose
//! identifier starts with the target: attaches, loads a script, and only then
//! resumes the process. Session detachments are tracked and the run ends once
//! no session has been attached for a debounce interval.
//!
//! All lifecycle work runs on one [`task_reactor::Reactor`]; device callbacks
//! arrive on arbitrary threads and only ever enqueue tasks.

pub mod config;
mod controller;
pub mod device;
pub mod error;
pub mod idle;
mod lifecycle;
#[cfg(unix)]
pub mod local;
pub mod registry;
pub mod report;

#[cfg(test)]
mod test_helpers;

pub use controller::{
    Controller, ControllerConfig, RunSummary, ScriptFailurePolicy, UnmatchedSpawnPolicy,
};
pub use device::{DetachReason, Device, DeviceEvent, Pid, Script, ScriptMessage, Session};
pub use error::{ControllerError, DeviceError, InstrumentError, RegistryError};
pub use report::Report;
pub use task_reactor::StopSignal;
