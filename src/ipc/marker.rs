//! Marker file fallback.
//!
//! A writer that cannot reach the socket leaves the token of its request in
//! the marker file. The daemon watches the file and removes it once a
//! completed reload covers that token.

use crate::store::write_atomic;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Record a reload request.
pub fn write(path: &Path, token: u64) -> io::Result<()> {
    write_atomic(path, format!("{}\n", token).as_bytes())
}

/// Token of the pending request, if any. An unreadable marker counts as
/// token 0.
pub fn read(path: &Path) -> Option<u64> {
    match fs::read_to_string(path) {
        Ok(text) => Some(text.trim().parse().unwrap_or(0)),
        Err(_) => None,
    }
}

/// Remove the marker unconditionally.
pub fn clear(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove the marker if a reload of `token` answers it. Returns whether a
/// marker was removed.
pub fn clear_if_covered(path: &Path, token: u64) -> io::Result<bool> {
    match read(path) {
        Some(pending) if pending <= token => {
            clear(path)?;
            debug!("Cleared reload marker {} (covered by {})", pending, token);
            Ok(true)
        }
        _ => Ok(false),
    }
}
