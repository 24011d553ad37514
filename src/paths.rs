//! Where things live on disk.
//!
//! The menu file defaults to `$XDG_CONFIG_HOME/trayrunner/commands.yaml`.
//! Runtime files (lock, socket, marker, logs) go to a per-instance state
//! directory so that daemons for different configuration directories never
//! share a lock or a socket.

use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Overrides the base state directory.
pub const STATE_DIR_ENV: &str = "TRAYRUNNER_STATE_DIR";

pub const CONFIG_FILE: &str = "commands.yaml";
pub const SETTINGS_FILE: &str = "settings.toml";

const LOCK_FILE: &str = "trayrunner.lock";
const SOCKET_FILE: &str = "reload.sock";
const MARKER_FILE: &str = "reload.marker";
const EXEC_LOG_FILE: &str = "run.log";
const DAEMON_LOG_FILE: &str = "daemon.log";
const CRASH_LOG_FILE: &str = "crash.log";

/// Hex digits of the config directory hash used as instance id.
const INSTANCE_ID_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum PathsError {
    #[error("Failed to find home directory")]
    NoHomeDir,

    #[error("Failed to create state directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "trayrunner")
}

/// `$XDG_CONFIG_HOME/trayrunner`.
pub fn default_config_dir() -> Result<PathBuf, PathsError> {
    project_dirs()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or(PathsError::NoHomeDir)
}

pub fn default_config_path() -> Result<PathBuf, PathsError> {
    Ok(default_config_dir()?.join(CONFIG_FILE))
}

/// Base state directory: the environment override, `$XDG_STATE_HOME/trayrunner`,
/// or `~/.local/state/trayrunner`.
pub fn base_state_dir() -> Result<PathBuf, PathsError> {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = project_dirs().and_then(|d| d.state_dir().map(Path::to_path_buf)) {
        return Ok(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join("trayrunner"))
        .ok_or(PathsError::NoHomeDir)
}

/// Runtime file locations for one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    dir: PathBuf,
}

impl RuntimePaths {
    /// Use `dir` as is.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolve the state directory for the configuration file at
    /// `config_path`. The default configuration uses the base directory;
    /// any other one gets `instances/<id>/` below it.
    pub fn for_config(config_path: &Path) -> Result<Self, PathsError> {
        let base = base_state_dir()?;
        let config_dir = canonical_dir(config_path);
        let is_default = default_config_dir()
            .map(|d| normalize(&d) == config_dir)
            .unwrap_or(false);

        if is_default {
            Ok(Self::at(base))
        } else {
            Ok(Self::at(base.join("instances").join(instance_id(&config_dir))))
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub fn socket(&self) -> PathBuf {
        self.dir.join(SOCKET_FILE)
    }

    pub fn marker(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    pub fn exec_log(&self) -> PathBuf {
        self.dir.join(EXEC_LOG_FILE)
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.dir.join(DAEMON_LOG_FILE)
    }

    pub fn crash_log(&self) -> PathBuf {
        self.dir.join(CRASH_LOG_FILE)
    }

    /// Create the directory (owner-only on unix).
    pub fn ensure(&self) -> Result<(), PathsError> {
        let err = |source| PathsError::CreateDir {
            path: self.dir.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700)).map_err(err)?;
        }
        Ok(())
    }
}

/// Settings file that sits next to a configuration file.
pub fn settings_path_for(config_path: &Path) -> PathBuf {
    config_path.with_file_name(SETTINGS_FILE)
}

/// First hex digits of the SHA-256 of the directory path.
pub fn instance_id(config_dir: &Path) -> String {
    let digest = Sha256::digest(config_dir.to_string_lossy().as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(INSTANCE_ID_LEN);
    id
}

fn canonical_dir(config_path: &Path) -> PathBuf {
    let dir = match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    normalize(&dir)
}

fn normalize(dir: &Path) -> PathBuf {
    fs::canonicalize(dir)
        .or_else(|_| std::path::absolute(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
}
