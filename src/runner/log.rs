//! Append-only execution log, one line per event.
//!
//! ```text
//! 2024-05-01T10:22:03.120+02:00 mode=shell outcome=launched pid=4242 label="Backup" cmd="rsync -a ~ /mnt"
//! 2024-05-01T10:22:09.871+02:00 mode=shell outcome=exited code=0 label="Backup" cmd="rsync -a ~ /mnt"
//! ```

use super::{ExecutionMode, Outcome};
use chrono::{DateTime, Local, SecondsFormat};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct ExecLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ExecLog {
    /// Open `path` for appending, creating it owner-only.
    pub fn open(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Failures are logged and otherwise ignored.
    pub fn record(&self, mode: ExecutionMode, outcome: &Outcome, label: &str, cmd: &str) {
        let line = format_line(Local::now(), mode, outcome, label, cmd);
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("Failed to write execution log {}: {}", self.path.display(), e);
        }
    }
}

fn format_line(
    at: DateTime<Local>,
    mode: ExecutionMode,
    outcome: &Outcome,
    label: &str,
    cmd: &str,
) -> String {
    format!(
        "{} mode={} outcome={} label={:?} cmd={:?}\n",
        at.to_rfc3339_opts(SecondsFormat::Millis, false),
        mode,
        outcome,
        label,
        cmd
    )
}
