//! Timestamped snapshots of the configuration file.
//!
//! A backup is a plain copy next to the original, named
//! `<file>.bak-YYYYMMDD-HHMMSS` after local time. Further saves in the same
//! second get `-2`, `-3`, ... appended, continuing after the highest number
//! already on disk. Backups are never removed implicitly; see [`prune`].

use chrono::{Local, NaiveDateTime};
use std::cmp::Reverse;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Names tried past the highest existing sequence before giving up. Only a
/// concurrent writer taking the same names can use them up.
pub const MAX_COLLISIONS: u32 = 16;

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const STAMP_LEN: usize = 15;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to back up {path}: {source}")]
    Copy { path: PathBuf, source: io::Error },

    #[error("No free backup name for {path} after {attempts} attempts")]
    Exhausted { path: PathBuf, attempts: u32 },

    #[error("Failed to list backups in {dir}: {source}")]
    List { dir: PathBuf, source: io::Error },

    #[error("{backup} is not a backup of {path}")]
    Foreign { path: PathBuf, backup: PathBuf },

    #[error("Failed to restore {path}: {source}")]
    Restore { path: PathBuf, source: io::Error },
}

/// One snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// The file that was copied.
    pub source: PathBuf,
    /// Local time encoded in the name.
    pub timestamp: NaiveDateTime,
    /// The copy itself.
    pub copy: PathBuf,
}

/// Back up `path` if it exists. Returns `None` when there is nothing to copy.
pub fn create(path: &Path) -> Result<Option<BackupRecord>, BackupError> {
    create_at(path, Local::now().naive_local())
}

/// [`create`] with an explicit timestamp.
pub fn create_at(path: &Path, now: NaiveDateTime) -> Result<Option<BackupRecord>, BackupError> {
    let mut source = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No backup needed, {} does not exist", path.display());
            return Ok(None);
        }
        Err(source) => {
            return Err(BackupError::Copy {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let copy_err = |source| BackupError::Copy {
        path: path.to_path_buf(),
        source,
    };

    let base = format!("{}.bak-{}", file_name(path), now.format(STAMP_FORMAT));
    let first = next_seq(path, now)?;
    for seq in first..first.saturating_add(MAX_COLLISIONS) {
        let name = if seq == 1 {
            base.clone()
        } else {
            format!("{}-{}", base, seq)
        };
        let copy = path.with_file_name(&name);

        let mut target = match OpenOptions::new().write(true).create_new(true).open(&copy) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(copy_err(e)),
        };

        let written = io::copy(&mut source, &mut target)
            .and_then(|_| {
                let perms = source.metadata()?.permissions();
                target.set_permissions(perms)
            })
            .and_then(|_| target.sync_all());
        if let Err(e) = written {
            // Leave no half-written copy behind.
            let _ = fs::remove_file(&copy);
            return Err(copy_err(e));
        }

        info!("Backed up {} to {}", path.display(), copy.display());
        return Ok(Some(BackupRecord {
            source: path.to_path_buf(),
            timestamp: now,
            copy,
        }));
    }

    warn!("All backup names for {} are taken", path.display());
    Err(BackupError::Exhausted {
        path: path.to_path_buf(),
        attempts: MAX_COLLISIONS,
    })
}

/// All backups of `path`, newest first.
pub fn list(path: &Path) -> Result<Vec<BackupRecord>, BackupError> {
    let mut found = scan(path)?;
    found.sort_by_key(|(seq, record)| Reverse((record.timestamp, *seq)));
    Ok(found.into_iter().map(|(_, record)| record).collect())
}

/// First free sequence number for backups stamped `now`.
fn next_seq(path: &Path, now: NaiveDateTime) -> Result<u32, BackupError> {
    let highest = scan(path)?
        .into_iter()
        .filter(|(_, record)| record.timestamp == now)
        .map(|(seq, _)| seq)
        .max();
    Ok(highest.map_or(1, |seq| seq.saturating_add(1)))
}

fn scan(path: &Path) -> Result<Vec<(u32, BackupRecord)>, BackupError> {
    let dir = parent_dir(path);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BackupError::List {
                dir: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BackupError::List {
            dir: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((timestamp, seq)) = parse_backup_name(path, name) {
            found.push((
                seq,
                BackupRecord {
                    source: path.to_path_buf(),
                    timestamp,
                    copy: entry.path(),
                },
            ));
        }
    }

    Ok(found)
}

/// Replace `path` with the contents of `backup`.
///
/// The current file is backed up first, so a restore can itself be undone.
/// Returns that safety copy.
pub fn restore(path: &Path, backup: &Path) -> Result<Option<BackupRecord>, BackupError> {
    let belongs = backup
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| parse_backup_name(path, n))
        .is_some();
    if !belongs {
        return Err(BackupError::Foreign {
            path: path.to_path_buf(),
            backup: backup.to_path_buf(),
        });
    }

    let restore_err = |source| BackupError::Restore {
        path: path.to_path_buf(),
        source,
    };
    let contents = fs::read(backup).map_err(restore_err)?;
    let safety = create(path)?;
    crate::store::write_atomic(path, &contents).map_err(restore_err)?;
    info!("Restored {} from {}", path.display(), backup.display());
    Ok(safety)
}

/// Delete all but the `keep` newest backups. Returns the removed copies.
pub fn prune(path: &Path, keep: usize) -> Result<Vec<PathBuf>, BackupError> {
    let mut removed = Vec::new();
    for record in list(path)?.into_iter().skip(keep) {
        fs::remove_file(&record.copy).map_err(|source| BackupError::Copy {
            path: record.copy.clone(),
            source,
        })?;
        debug!("Pruned backup {}", record.copy.display());
        removed.push(record.copy);
    }
    if !removed.is_empty() {
        info!("Pruned {} backup(s) of {}", removed.len(), path.display());
    }
    Ok(removed)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Parse `<file>.bak-YYYYMMDD-HHMMSS[-N]` into its timestamp and sequence.
fn parse_backup_name(path: &Path, name: &str) -> Option<(NaiveDateTime, u32)> {
    let prefix = format!("{}.bak-", file_name(path));
    let rest = name.strip_prefix(&prefix)?;
    let stamp = rest.get(..STAMP_LEN)?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    let seq = match &rest[STAMP_LEN..] {
        "" => 1,
        suffix => suffix.strip_prefix('-')?.parse().ok()?,
    };
    Some((timestamp, seq))
}
