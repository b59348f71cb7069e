//! Configuration resolution for Takopi.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/takopi/settings.json)
//! 3. Environment variables (highest priority)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::EngineId;

/// Complete Takopi configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Per-engine overrides keyed by engine name.
    #[serde(default)]
    pub engines: HashMap<EngineId, EngineConfig>,
}

/// Run orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum concurrent agent runs across all engines.
    pub max_concurrent_runs: u32,
    /// Idle timeout armed after session establishment (seconds).
    pub idle_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL (seconds).
    pub terminate_grace_secs: u64,
    /// How many trailing stderr lines to keep for diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 3,
            idle_timeout_secs: 300,
            terminate_grace_secs: 2,
            stderr_tail_lines: 30,
        }
    }
}

impl RunnerConfig {
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Outbound request pump configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Minimum interval between dispatches sharing a scope key
    /// (milliseconds). Zero disables throttling.
    pub dispatch_interval_ms: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 1100,
        }
    }
}

impl PumpConfig {
    pub const fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

/// Progress publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Minimum interval between published progress edits (seconds).
    pub publish_interval_secs: u64,
    /// How many recent action lines a progress message shows.
    pub max_action_lines: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 4,
            max_action_lines: 6,
        }
    }
}

impl ProgressConfig {
    pub const fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }
}

/// Per-engine CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Binary to invoke; defaults to the engine name resolved via PATH.
    pub binary: Option<PathBuf>,
    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Config {
    /// Binary path for an engine, falling back to the bare engine name.
    pub fn engine_binary(&self, engine: EngineId) -> PathBuf {
        self.engines
            .get(&engine)
            .and_then(|e| e.binary.clone())
            .unwrap_or_else(|| PathBuf::from(engine.as_str()))
    }

    /// Extra arguments configured for an engine.
    pub fn engine_extra_args(&self, engine: EngineId) -> &[String] {
        self.engines
            .get(&engine)
            .map_or(&[], |e| e.extra_args.as_slice())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config() -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".takopi").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/takopi/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("takopi").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.runner = overlay.runner;
    base.pump = overlay.pump;
    base.progress = overlay.progress;
    base.engines.extend(overlay.engines);
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("TAKOPI_MAX_CONCURRENT_RUNS")
        && let Ok(n) = val.parse()
    {
        config.runner.max_concurrent_runs = n;
    }
    if let Ok(val) = std::env::var("TAKOPI_IDLE_TIMEOUT_SECS")
        && let Ok(n) = val.parse()
    {
        config.runner.idle_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("TAKOPI_DISPATCH_INTERVAL_MS")
        && let Ok(n) = val.parse()
    {
        config.pump.dispatch_interval_ms = n;
    }
    for engine in EngineId::ALL {
        let var = format!("TAKOPI_{}_BIN", engine.as_str().to_uppercase());
        if let Ok(val) = std::env::var(&var) {
            config.engines.entry(engine).or_default().binary = Some(PathBuf::from(val));
        }
    }
}
