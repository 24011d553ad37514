//! Reload signalling between writers and the daemon.
//!
//! A writer (editor, CLI) that saved the configuration calls
//! [`request_reload`]. The daemon answers through a unix socket in its state
//! directory; when the socket is unreachable the writer falls back to a
//! marker file the daemon watches. Requests are coalesced by the daemon's
//! [`ReloadScheduler`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

mod client;
pub mod marker;
mod scheduler;
mod server;
mod types;

pub use client::{request_reload, DEFAULT_TIMEOUT};
pub use scheduler::{Finished, ReloadScheduler, DEFAULT_WINDOW};
pub use server::{ReloadListener, ReloadSignal};
pub use types::*;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to bind: {0}")]
    BindFailed(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    RecvFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Failed to write reload marker {path}: {source}")]
    Marker {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// How a reload request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A completed reload covers the request.
    Acknowledged { token: u64 },
    /// No daemon holds the instance lock.
    NotRunning,
    /// No answer within the timeout.
    Timeout,
    /// The daemon answered but did not reload.
    Rejected { message: String },
}

impl fmt::Display for ReloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadOutcome::Acknowledged { token } => write!(f, "acknowledged (token {})", token),
            ReloadOutcome::NotRunning => write!(f, "daemon not running"),
            ReloadOutcome::Timeout => write!(f, "timed out"),
            ReloadOutcome::Rejected { message } => write!(f, "rejected: {}", message),
        }
    }
}
