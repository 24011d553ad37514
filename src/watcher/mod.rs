//! Debounced change notifications for a single file.
//!
//! A [`ChangeSource`] produces raw wake-ups: inotify events on the parent
//! directory, or a fingerprint change seen by polling. The watcher task
//! turns bursts of wake-ups into one [`ChangeEvent`] per settled state of
//! the file, and only when the file actually differs from what was last
//! reported.

mod inotify;
mod poll;

pub use self::inotify::InotifySource;
pub use self::poll::PollSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events buffered between the watcher task and its consumer.
const EVENT_BUFFER: usize = 16;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Native file watching unavailable: {0}")]
    Native(#[from] nix::errno::Errno),

    #[error("Watch I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watched directory {0} went away")]
    DirectoryGone(PathBuf),
}

/// Identity of a file's contents as far as the filesystem can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub modified: Option<SystemTime>,
    pub len: u64,
    pub inode: u64,
}

impl Fingerprint {
    /// Fingerprint of `path`, or `None` if it does not exist.
    pub fn read(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode: inode(&meta),
        })
    }

    /// Modification time in nanoseconds since the Unix epoch.
    pub fn mtime_nanos(&self) -> u64 {
        self.modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

/// One settled change of the watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
    /// `None` when the file was removed.
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Native when available, polling otherwise.
    #[default]
    Auto,
    Native,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Wake-ups must stop for this long before the state counts as settled.
    pub quiescence: Duration,
    pub poll_interval: Duration,
    pub backend: Backend,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            quiescence: Duration::from_millis(300),
            poll_interval: Duration::from_secs(1),
            backend: Backend::Auto,
        }
    }
}

/// Source of raw wake-ups for one file.
#[async_trait]
pub trait ChangeSource: Send {
    /// Resolve on the next wake-up. An error means the source is dead.
    async fn wait(&mut self) -> Result<(), WatchError>;

    fn name(&self) -> &'static str;
}

enum Control {
    Restart,
    Ignore(Fingerprint),
}

/// Consumer end of a running watcher. Dropping it stops the task.
pub struct WatchHandle {
    events: mpsc::Receiver<ChangeEvent>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Next settled change. `None` once the watcher stopped.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Recreate the underlying source, keeping the last reported state.
    pub fn restart(&self) {
        let _ = self.control.send(Control::Restart);
    }

    /// Do not report the state identified by `fingerprint`, typically the
    /// caller's own save.
    pub fn ignore(&self, fingerprint: Fingerprint) {
        let _ = self.control.send(Control::Ignore(fingerprint));
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct FileWatcher;

impl FileWatcher {
    /// Start watching `path`. Must be called inside a tokio runtime.
    ///
    /// Fails only when [`Backend::Native`] is requested and unavailable.
    pub fn spawn(
        path: impl Into<PathBuf>,
        options: WatchOptions,
    ) -> Result<WatchHandle, WatchError> {
        let path = path.into();
        let source = open_source(&path, &options)?;
        info!("Watching {} ({})", path.display(), source.name());

        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (control, control_rx) = mpsc::unbounded_channel();
        let state = WatchState {
            last: Fingerprint::read(&path),
            ignored: None,
            path,
            options,
        };
        let task = tokio::spawn(state.run(source, event_tx, control_rx));

        Ok(WatchHandle {
            events,
            control,
            task,
        })
    }
}

fn open_source(path: &Path, options: &WatchOptions) -> Result<Box<dyn ChangeSource>, WatchError> {
    match options.backend {
        Backend::Poll => Ok(Box::new(PollSource::new(path, options.poll_interval))),
        Backend::Native => Ok(Box::new(InotifySource::new(path)?)),
        Backend::Auto => match InotifySource::new(path) {
            Ok(source) => Ok(Box::new(source)),
            Err(e) => {
                warn!("{}, falling back to polling", e);
                Ok(Box::new(PollSource::new(path, options.poll_interval)))
            }
        },
    }
}

struct WatchState {
    path: PathBuf,
    options: WatchOptions,
    last: Option<Fingerprint>,
    ignored: Option<Fingerprint>,
}

enum Wake {
    Source(Result<(), WatchError>),
    Control(Option<Control>),
}

impl WatchState {
    async fn run(
        mut self,
        mut source: Box<dyn ChangeSource>,
        events: mpsc::Sender<ChangeEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            let wake = tokio::select! {
                r = source.wait() => Wake::Source(r),
                c = control.recv() => Wake::Control(c),
            };

            match wake {
                Wake::Source(Ok(())) => {
                    if let Err(e) = self.settle(source.as_mut()).await {
                        source = self.degrade(e);
                    }
                    while let Ok(c) = control.try_recv() {
                        self.apply(c, &mut source);
                    }
                    if !self.check(&events).await {
                        break;
                    }
                }
                Wake::Source(Err(e)) => {
                    source = self.degrade(e);
                    if !self.check(&events).await {
                        break;
                    }
                }
                Wake::Control(Some(c)) => {
                    let restarted = matches!(c, Control::Restart);
                    self.apply(c, &mut source);
                    if restarted && !self.check(&events).await {
                        break;
                    }
                }
                Wake::Control(None) => break,
            }
        }
        debug!("Watcher for {} stopped", self.path.display());
    }

    /// Wait until wake-ups stop for the quiescence window.
    async fn settle(&self, source: &mut dyn ChangeSource) -> Result<(), WatchError> {
        loop {
            match tokio::time::timeout(self.options.quiescence, source.wait()).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()),
            }
        }
    }

    fn apply(&mut self, control: Control, source: &mut Box<dyn ChangeSource>) {
        match control {
            Control::Ignore(fingerprint) => self.ignored = Some(fingerprint),
            Control::Restart => match open_source(&self.path, &self.options) {
                Ok(fresh) => {
                    debug!("Restarted watcher for {} ({})", self.path.display(), fresh.name());
                    *source = fresh;
                }
                Err(e) => warn!("Failed to restart watcher: {}", e),
            },
        }
    }

    fn degrade(&self, err: WatchError) -> Box<dyn ChangeSource> {
        warn!("File watcher failed ({}), switching to polling", err);
        Box::new(PollSource::new(&self.path, self.options.poll_interval))
    }

    /// Emit an event if the file differs from the last reported state.
    /// Returns `false` when the consumer is gone.
    async fn check(&mut self, events: &mpsc::Sender<ChangeEvent>) -> bool {
        let current = Fingerprint::read(&self.path);
        if current == self.last {
            return true;
        }
        self.last = current;

        if current.is_some() && current == self.ignored {
            debug!("Ignoring own change to {}", self.path.display());
            self.ignored = None;
            return true;
        }

        let event = ChangeEvent {
            path: self.path.clone(),
            modified: current.and_then(|f| f.modified),
            fingerprint: current,
        };
        debug!("Change settled for {}", self.path.display());
        events.send(event).await.is_ok()
    }
}
