use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use task_reactor::{Reactor, RunStats, StopSignal};
use tokio::sync::mpsc;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::device::{Device, Pid};
use crate::error::ControllerError;
use crate::idle::DEFAULT_DEBOUNCE;
use crate::lifecycle::{Lifecycle, Task};
use crate::report::{Report, Reporter};

/// What to do with a gated spawn that does not match the target
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedSpawnPolicy {
    /// Leave it paused and track it
    #[default]
    Hold,
    /// Let it run uninstrumented
    Resume,
}

/// What to do with a process whose script failed to create or load
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScriptFailurePolicy {
    /// Stay attached, leave the process paused
    #[default]
    Keep,
    /// Detach and resume the process uninstrumented
    Detach,
    /// Kill the paused process
    Kill,
}

/// Everything the controller needs for one run
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Application identifier; spawns whose identifier starts with it are instrumented
    pub target: String,
    pub script_source: String,
    pub debounce: Duration,
    pub unmatched_spawns: UnmatchedSpawnPolicy,
    pub script_failure: ScriptFailurePolicy,
}

impl ControllerConfig {
    pub fn new(target: impl Into<String>, script_source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            script_source: script_source.into(),
            debounce: DEFAULT_DEBOUNCE,
            unmatched_spawns: UnmatchedSpawnPolicy::default(),
            script_failure: ScriptFailurePolicy::default(),
        }
    }
}

/// Outcome of a run that did not fail at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub stats: RunStats,
    /// Processes that were attached, injected and resumed
    pub instrumented: usize,
    pub failures: usize,
    /// Pids still attached when the run ended (non-empty only after an external stop)
    pub attached: Vec<Pid>,
    /// Non-matching spawns still gated
    pub held: Vec<Pid>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instrumented={} failures={} attached={} held={} tasks={} dropped={}",
            self.instrumented,
            self.failures,
            self.attached.len(),
            self.held.len(),
            self.stats.executed,
            self.stats.dropped
        )
    }
}

/// Drives one spawn-gating run against a device.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use spawn_gate::{Controller, ControllerConfig, Device};
/// # async fn demo(device: Arc<dyn Device>) -> Result<(), spawn_gate::ControllerError> {
/// let controller = Controller::new(device, ControllerConfig::new("com.example.app", "..."));
/// let mut reports = controller.subscribe();
/// tokio::spawn(async move {
///     while let Some(report) = reports.recv().await {
///         println!("{report}");
///     }
/// });
/// let summary = controller.run().await?;
/// println!("{summary}");
/// # Ok(())
/// # }
/// ```
pub struct Controller {
    reactor: Reactor<Task>,
    lifecycle: Lifecycle,
    reporter: Reporter,
}

impl Controller {
    pub fn new(device: Arc<dyn Device>, config: ControllerConfig) -> Self {
        let reporter = Reporter::new();
        Self {
            reactor: Reactor::new(),
            lifecycle: Lifecycle::new(device, config, reporter.clone()),
            reporter,
        }
    }

    /// Subscribe to lifecycle reports. Subscribe before `run` to see all of them.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Report> {
        self.reporter.subscribe()
    }

    /// Setting the returned signal ends the run early
    pub fn stop_signal(&self) -> StopSignal {
        self.reactor.handle().stop_signal()
    }

    /// Start the target and process events until idle or stopped.
    ///
    /// Only a startup failure (spawn gating or spawning the target) is an
    /// error; per-process failures are reported and counted.
    pub async fn run(self) -> Result<RunSummary, ControllerError> {
        let Controller {
            reactor,
            mut lifecycle,
            reporter,
        } = self;
        drop(reporter);

        let span = info_span!("run", run_id = %Uuid::new_v4(), target = %lifecycle.target());
        reactor.handle().schedule(Task::Start);

        let stats = reactor.run(&mut lifecycle).instrument(span).await;
        info!(
            "Run finished: executed={} failed={} dropped={}",
            stats.executed, stats.failed, stats.dropped
        );
        lifecycle.finish(stats)
    }
}
