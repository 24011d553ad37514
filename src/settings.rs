//! Application settings (`settings.toml` next to the menu file).
//!
//! Every field has a default, so a missing file or a partial one is fine.

use crate::paths::settings_path_for;
use crate::runner::{RunnerOptions, DEFAULT_TERMINALS};
use crate::watcher::{Backend, WatchOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Bounds for the debounce, poll and coalescing windows.
const MIN_WINDOW_MS: u64 = 10;
const MAX_WINDOW_MS: u64 = 10_000;

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 60_000;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    ReadError { path: PathBuf, source: io::Error },

    #[error("Failed to parse settings: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid settings: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub watch: WatchSettings,

    #[serde(default)]
    pub reload: ReloadSettings,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub editor: EditorSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Quiet period before a burst of changes counts as settled
    #[serde(default = "default_quiescence_ms")]
    pub quiescence_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// auto, native or poll
    #[serde(default)]
    pub backend: Backend,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            quiescence_ms: default_quiescence_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            backend: Backend::default(),
        }
    }
}

fn default_quiescence_ms() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSettings {
    /// Requests inside this window share one reload
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,

    /// How long `trayrunner reload` waits for an answer
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            coalesce_ms: default_coalesce_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_coalesce_ms() -> u64 {
    250
}

fn default_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Terminal emulators, tried in order
    #[serde(default = "default_terminals")]
    pub terminals: Vec<String>,

    #[serde(default = "default_stderr_tail_bytes")]
    pub stderr_tail_bytes: usize,

    #[serde(default = "default_true")]
    pub notify_on_launch: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            terminals: default_terminals(),
            stderr_tail_bytes: default_stderr_tail_bytes(),
            notify_on_launch: true,
        }
    }
}

fn default_terminals() -> Vec<String> {
    DEFAULT_TERMINALS.iter().map(|s| s.to_string()).collect()
}

fn default_stderr_tail_bytes() -> usize {
    200
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write daemon.log in the state directory
    #[serde(default = "default_true")]
    pub file: bool,

    /// Write daemon.log as one JSON object per line
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: true,
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorSettings {
    /// Ask the daemon to reload after every save
    #[serde(default = "default_true")]
    pub reload_after_save: bool,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            reload_after_save: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::ReadError {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&contents)
    }

    /// Settings that belong to the menu file at `config_path`.
    pub fn load_for(config_path: &Path) -> Result<Self, SettingsError> {
        Self::load(&settings_path_for(config_path))
    }

    pub fn parse(contents: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_window("watch.quiescence_ms", self.watch.quiescence_ms)?;
        check_window("watch.poll_interval_ms", self.watch.poll_interval_ms)?;
        check_window("reload.coalesce_ms", self.reload.coalesce_ms)?;

        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.reload.timeout_ms) {
            return Err(SettingsError::ValidationError(format!(
                "reload.timeout_ms must be between {} and {}",
                MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
            )));
        }

        if self.runner.terminals.iter().all(|t| t.trim().is_empty()) {
            return Err(SettingsError::ValidationError(
                "runner.terminals must name at least one emulator".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(SettingsError::ValidationError(format!(
                "logging.level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            quiescence: Duration::from_millis(self.watch.quiescence_ms),
            poll_interval: Duration::from_millis(self.watch.poll_interval_ms),
            backend: self.watch.backend,
        }
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.reload.coalesce_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload.timeout_ms)
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            terminals: self
                .runner
                .terminals
                .iter()
                .filter(|t| !t.trim().is_empty())
                .cloned()
                .collect(),
            stderr_tail_bytes: self.runner.stderr_tail_bytes,
            notify_on_launch: self.runner.notify_on_launch,
        }
    }
}

fn check_window(name: &str, ms: u64) -> Result<(), SettingsError> {
    if (MIN_WINDOW_MS..=MAX_WINDOW_MS).contains(&ms) {
        Ok(())
    } else {
        Err(SettingsError::ValidationError(format!(
            "{} must be between {} and {}",
            name, MIN_WINDOW_MS, MAX_WINDOW_MS
        )))
    }
}
