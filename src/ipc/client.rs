//! Writer side: ask a running daemon to reload.

use super::{marker, IpcError, ReloadOutcome, ReloadReply, ReloadRequest, ReplyStatus};
use crate::instance;
use crate::paths::RuntimePaths;
use crate::watcher::Fingerprint;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info};

/// Default bound for the whole exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the marker fallback checks whether the daemon consumed it.
const MARKER_POLL: Duration = Duration::from_millis(50);

/// Ask the daemon owning `paths` to reload `config_path` and wait until a
/// reload covering the current state of the file has completed.
///
/// The request token is the file's modification time, so a reload that was
/// already running when the file was saved does not count.
pub async fn request_reload(
    paths: &RuntimePaths,
    config_path: &Path,
    timeout: Duration,
) -> Result<ReloadOutcome, IpcError> {
    if !instance::is_running(paths) {
        debug!("No daemon holds {}", paths.lock_file().display());
        return Ok(ReloadOutcome::NotRunning);
    }

    let token = Fingerprint::read(config_path)
        .map(|f| f.mtime_nanos())
        .unwrap_or(0);

    let marker_path = paths.marker();
    marker::write(&marker_path, token).map_err(|source| IpcError::Marker {
        path: marker_path.clone(),
        source,
    })?;

    match tokio::time::timeout(timeout, exchange(paths, token)).await {
        Ok(outcome) => {
            let outcome = outcome?;
            info!("Reload request: {}", outcome);
            Ok(outcome)
        }
        Err(_) => {
            info!("Reload request timed out after {:?}", timeout);
            Ok(ReloadOutcome::Timeout)
        }
    }
}

async fn exchange(paths: &RuntimePaths, token: u64) -> Result<ReloadOutcome, IpcError> {
    match UnixStream::connect(paths.socket()).await {
        Ok(stream) => send(stream, token).await,
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) =>
        {
            debug!("Socket unavailable ({}), waiting on marker", e);
            wait_for_marker(paths, token).await
        }
        Err(e) => Err(IpcError::ConnectFailed(e.to_string())),
    }
}

async fn send(stream: UnixStream, token: u64) -> Result<ReloadOutcome, IpcError> {
    let (read, mut write) = stream.into_split();

    let json = serde_json::to_string(&ReloadRequest::reload(token))
        .map_err(|e| IpcError::Serialization(e.to_string()))?;
    write
        .write_all(format!("{}\n", json).as_bytes())
        .await
        .map_err(|e| IpcError::SendFailed(e.to_string()))?;
    write
        .flush()
        .await
        .map_err(|e| IpcError::SendFailed(e.to_string()))?;

    let mut line = String::new();
    let n = BufReader::new(read)
        .read_line(&mut line)
        .await
        .map_err(|e| IpcError::RecvFailed(e.to_string()))?;
    if n == 0 {
        return Err(IpcError::ConnectionClosed);
    }

    let reply: ReloadReply =
        serde_json::from_str(&line).map_err(|e| IpcError::RecvFailed(e.to_string()))?;
    Ok(outcome_of(reply, token))
}

fn outcome_of(reply: ReloadReply, token: u64) -> ReloadOutcome {
    match reply.status {
        ReplyStatus::Ack => ReloadOutcome::Acknowledged {
            token: reply.token.unwrap_or(token),
        },
        ReplyStatus::Busy | ReplyStatus::Error => ReloadOutcome::Rejected {
            message: reply
                .error
                .unwrap_or_else(|| "request rejected".to_string()),
        },
    }
}

async fn wait_for_marker(paths: &RuntimePaths, token: u64) -> Result<ReloadOutcome, IpcError> {
    let marker_path = paths.marker();
    loop {
        if marker::read(&marker_path).is_none() {
            return Ok(ReloadOutcome::Acknowledged { token });
        }
        if !instance::is_running(paths) {
            return Ok(ReloadOutcome::NotRunning);
        }
        tokio::time::sleep(MARKER_POLL).await;
    }
}
