//! One daemon per configuration directory.
//!
//! The guard is an exclusive `flock` on the instance's lock file. The kernel
//! drops the lock when the holder exits, however it exits, so there is no
//! stale state to clean up after a crash.

use crate::paths::RuntimePaths;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use std::time::Duration;
use tracing::{debug, info};

/// Tries before a busy lock counts as held by a daemon.
const CONTENTION_ATTEMPTS: u32 = 10;
const CONTENTION_DELAY: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Daemon already running{}", pid_suffix(.pid))]
    AlreadyRunning { pid: Option<u32> },

    #[error("Failed to open lock file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Failed to lock {path}: {errno}")]
    Lock { path: PathBuf, errno: Errno },
}

fn pid_suffix(pid: &Option<u32>) -> String {
    pid.map(|p| format!(" (pid {})", p)).unwrap_or_default()
}

/// Held for the daemon's lifetime. Dropping it releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Take the instance lock without blocking.
///
/// The state directory must exist. On success the holder's pid is written
/// into the lock file for diagnostics.
pub fn acquire(paths: &RuntimePaths) -> Result<InstanceLock, InstanceError> {
    let path = paths.lock_file();
    let io_err = |source| InstanceError::Io {
        path: path.clone(),
        source,
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(io_err)?;

    let mut attempt = 1;
    let mut lock = loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => break lock,
            // A client checking `is_running` holds a shared lock for an
            // instant; a daemon holds it for good.
            Err((returned, errno))
                if errno == Errno::EWOULDBLOCK && attempt < CONTENTION_ATTEMPTS =>
            {
                debug!("Lock {} busy, retrying", path.display());
                file = returned;
                attempt += 1;
                std::thread::sleep(CONTENTION_DELAY);
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                let pid = read_pid(&path);
                debug!("Lock {} is held by pid {:?}", path.display(), pid);
                return Err(InstanceError::AlreadyRunning { pid });
            }
            Err((_, errno)) => return Err(InstanceError::Lock { path, errno }),
        }
    };

    lock.set_len(0).map_err(io_err)?;
    lock.write_all(format!("{}\n", std::process::id()).as_bytes())
        .map_err(io_err)?;
    lock.sync_all().map_err(io_err)?;

    info!("Acquired instance lock {}", path.display());
    Ok(InstanceLock { _lock: lock, path })
}

/// Whether some process holds the instance lock. Creates nothing.
pub fn is_running(paths: &RuntimePaths) -> bool {
    let Ok(file) = File::open(paths.lock_file()) else {
        return false;
    };
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        // Shared lock released on drop.
        Ok(_check) => false,
        Err((_, errno)) => errno == Errno::EWOULDBLOCK,
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
