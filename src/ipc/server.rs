//! Daemon side of the reload socket.

use super::{IpcError, ReloadReply, ReloadRequest};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SIGNAL_BUFFER: usize = 32;

/// A client must send its request line within this time.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest accepted request line.
const MAX_REQUEST_BYTES: u64 = 4096;

/// One reload request waiting for its reply.
#[derive(Debug)]
pub struct ReloadSignal {
    /// Modification time the writer saw; 0 when unknown.
    pub token: u64,
    reply: oneshot::Sender<ReloadReply>,
}

impl ReloadSignal {
    pub fn new(token: u64) -> (Self, oneshot::Receiver<ReloadReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { token, reply }, rx)
    }

    /// Whether the client stopped waiting for the reply.
    pub fn is_closed(&self) -> bool {
        self.reply.is_closed()
    }

    /// Answer the request. The client may already have given up.
    pub fn respond(self, reply: ReloadReply) {
        if self.reply.send(reply).is_err() {
            debug!("Reload client went away before the reply");
        }
    }
}

/// Accepts reload requests on a unix socket.
///
/// Dropping the listener stops accepting and removes the socket file.
/// Requests still queued are answered `busy`.
pub struct ReloadListener {
    path: PathBuf,
    signals: mpsc::Receiver<ReloadSignal>,
    accept: JoinHandle<()>,
}

impl ReloadListener {
    /// Bind `path`, replacing whatever socket file is there.
    ///
    /// Only call this while holding the instance lock: a leftover socket can
    /// then only belong to a dead daemon.
    pub fn bind(path: &Path) -> Result<Self, IpcError> {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(IpcError::BindFailed(format!("{}: {}", path.display(), e)));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| IpcError::BindFailed(format!("{}: {}", path.display(), e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
                warn!("Failed to restrict {}: {}", path.display(), e);
            }
        }

        info!("Reload socket listening on {}", path.display());

        let (tx, signals) = mpsc::channel(SIGNAL_BUFFER);
        let accept = tokio::spawn(accept_loop(listener, tx));

        Ok(Self {
            path: path.to_path_buf(),
            signals,
            accept,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next request. `None` once the accept loop has stopped.
    pub async fn next(&mut self) -> Option<ReloadSignal> {
        self.signals.recv().await
    }
}

impl Drop for ReloadListener {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = fs::remove_file(&self.path);
        debug!("Reload socket closed");
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<ReloadSignal>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, tx).await {
                        debug!("Reload connection: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Reload socket accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve(stream: UnixStream, tx: mpsc::Sender<ReloadSignal>) -> Result<(), IpcError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read).take(MAX_REQUEST_BYTES);
    let mut line = String::new();

    let n = tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| IpcError::RecvFailed("no request before timeout".to_string()))?
        .map_err(|e| IpcError::RecvFailed(e.to_string()))?;
    if n == 0 {
        return Err(IpcError::ConnectionClosed);
    }

    let reply = match ReloadRequest::parse(&line) {
        Ok(request) => {
            debug!(token = request.token(), "Reload request");
            let (signal, rx) = ReloadSignal::new(request.token());
            if tx.send(signal).await.is_err() {
                ReloadReply::busy()
            } else {
                rx.await.unwrap_or_else(|_| ReloadReply::busy())
            }
        }
        Err(e) => {
            warn!("Rejected reload request {:?}: {}", line.trim(), e);
            ReloadReply::error(format!("bad request: {}", e))
        }
    };

    let json = serde_json::to_string(&reply).map_err(|e| IpcError::Serialization(e.to_string()))?;
    write
        .write_all(format!("{}\n", json).as_bytes())
        .await
        .map_err(|e| IpcError::SendFailed(e.to_string()))?;
    write
        .flush()
        .await
        .map_err(|e| IpcError::SendFailed(e.to_string()))?;
    Ok(())
}
