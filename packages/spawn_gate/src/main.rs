use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use spawn_gate::config::{CliOverrides, FileConfig, default_config_path, load_config};
use spawn_gate::{Controller, Device, Report, RunSummary, ScriptFailurePolicy, UnmatchedSpawnPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "spawn-gate")]
#[command(about = "Instrument every spawn of an application before it runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Application identifier to spawn; matching spawns are instrumented
    target: Option<String>,

    /// Script to load into every matching process
    script: Option<PathBuf>,

    /// Config file (default: ~/.spawn-gate/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Quiet period with no sessions before the run ends
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// What to do with spawns that do not match the target
    #[arg(long, value_enum)]
    unmatched_spawns: Option<UnmatchedSpawnPolicy>,

    /// What to do with a process whose script failed to load
    #[arg(long, value_enum)]
    script_failure: Option<ScriptFailurePolicy>,

    /// How reports are printed
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    /// One JSON object per line
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Reports own stdout; logs go to stderr
    let default_directive = if cli.debug {
        "spawn_gate=debug,task_reactor=debug,info"
    } else {
        "spawn_gate=info,task_reactor=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_path = match &cli.config {
        Some(path) if !path.exists() => bail!("Config file {} does not exist", path.display()),
        Some(path) => Some(path.clone()),
        None => default_config_path(),
    };
    let file_config: FileConfig = load_config(config_path.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let resolved = file_config.resolve(CliOverrides {
        target: cli.target,
        script: cli.script,
        debounce_ms: cli.debounce_ms,
        unmatched_spawns: cli.unmatched_spawns,
        script_failure: cli.script_failure,
    })?;
    info!(
        "Instrumenting {} with {}",
        resolved.controller.target,
        resolved.script_path.display()
    );

    let device = local_device(resolved.device_args)?;
    let controller = Controller::new(device, resolved.controller);

    let printer = tokio::spawn(print_reports(controller.subscribe(), cli.format));

    let stop = controller.stop_signal();
    let signals = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping");
                stop.set();
            }
            Err(e) => warn!("Failed to install signal handlers: {}", e),
        }
    });

    let result = controller.run().await;
    signals.abort();
    printer.await.context("Report printer panicked")?;

    let summary = result?;
    print_summary(&summary, cli.format);
    Ok(())
}

#[cfg(unix)]
fn local_device(args: Vec<String>) -> Result<Arc<dyn Device>> {
    Ok(Arc::new(spawn_gate::local::LocalDevice::new(args)))
}

#[cfg(not(unix))]
fn local_device(_args: Vec<String>) -> Result<Arc<dyn Device>> {
    bail!("The local device is only available on unix")
}

/// Print reports until the controller goes away
async fn print_reports(mut reports: mpsc::UnboundedReceiver<Report>, format: OutputFormat) {
    while let Some(report) = reports.recv().await {
        match format {
            OutputFormat::Text => println!("{}", report),
            OutputFormat::Json => match serde_json::to_string(&report) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize report: {}", e),
            },
        }
    }
}

fn print_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Text => println!("done: {}", summary),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "event": "summary",
                "instrumented": summary.instrumented,
                "failures": summary.failures,
                "attached": summary.attached,
                "held": summary.held,
                "executed": summary.stats.executed,
                "failed_tasks": summary.stats.failed,
                "dropped": summary.stats.dropped,
            })
        ),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
