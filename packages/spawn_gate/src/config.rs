use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::controller::{ControllerConfig, ScriptFailurePolicy, UnmatchedSpawnPolicy};
use crate::idle::DEFAULT_DEBOUNCE;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [idle]
//                    debounce_ms = 250
//
//   env var:         SPAWN_GATE_IDLE__DEBOUNCE_MS=250   (double underscore = nesting)
//
// CLI arguments are applied last, in `FileConfig::resolve`.

const ENV_PREFIX: &str = "SPAWN_GATE_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub target: Option<String>,
    /// Path to the script injected into every matching process
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub idle: IdleFileConfig,
    #[serde(default)]
    pub policy: PolicyFileConfig,
    #[serde(default)]
    pub device: DeviceFileConfig,
}

/// Lives under `[idle]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdleFileConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for IdleFileConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE.as_millis() as u64
}

/// Lives under `[policy]` in config.toml.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyFileConfig {
    #[serde(default)]
    pub unmatched_spawns: UnmatchedSpawnPolicy,
    #[serde(default)]
    pub script_failure: ScriptFailurePolicy,
}

/// Lives under `[device]` in config.toml.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceFileConfig {
    /// Extra arguments passed to locally spawned targets
    #[serde(default)]
    pub args: Vec<String>,
}

/// Values given on the command line; each one beats the file and env layers.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub target: Option<String>,
    pub script: Option<PathBuf>,
    pub debounce_ms: Option<u64>,
    pub unmatched_spawns: Option<UnmatchedSpawnPolicy>,
    pub script_failure: Option<ScriptFailurePolicy>,
}

/// Fully resolved settings for one invocation
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub controller: ControllerConfig,
    pub script_path: PathBuf,
    pub device_args: Vec<String>,
}

/// `~/.spawn-gate/config.toml`, when a home directory is known
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".spawn-gate").join("config.toml"))
}

/// Build the layered figment: defaults, then the TOML file (if any), then
/// `SPAWN_GATE_*` env vars. A missing file contributes nothing.
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        debug!("Reading config from {}", path.display());
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

impl FileConfig {
    /// Apply CLI overrides and read the script source.
    pub fn resolve(self, cli: CliOverrides) -> Result<ResolvedConfig> {
        let Some(target) = cli.target.or(self.target) else {
            bail!("No target given: pass TARGET or set `target` in the config file");
        };
        let Some(script_path) = cli.script.or(self.script) else {
            bail!("No script given: pass SCRIPT or set `script` in the config file");
        };

        let script_source = std::fs::read_to_string(&script_path)
            .with_context(|| format!("Failed to read script {}", script_path.display()))?;

        let debounce_ms = cli.debounce_ms.unwrap_or(self.idle.debounce_ms);
        let controller = ControllerConfig {
            target,
            script_source,
            debounce: Duration::from_millis(debounce_ms),
            unmatched_spawns: cli
                .unmatched_spawns
                .unwrap_or(self.policy.unmatched_spawns),
            script_failure: cli.script_failure.unwrap_or(self.policy.script_failure),
        };

        Ok(ResolvedConfig {
            controller,
            script_path,
            device_args: self.device.args,
        })
    }
}
