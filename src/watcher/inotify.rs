use super::{ChangeSource, WatchError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent};
use std::ffi::OsString;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tracing::trace;

struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Linux inotify on the file's parent directory.
///
/// Watching the directory rather than the file keeps working across
/// write-to-temp-then-rename saves, which replace the inode.
pub struct InotifySource {
    fd: AsyncFd<InotifyFd>,
    dir: PathBuf,
    name: OsString,
}

impl InotifySource {
    /// Must be called inside a tokio runtime.
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| WatchError::DirectoryGone(path.to_path_buf()))?;

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch(
            &dir,
            AddWatchFlags::IN_CLOSE_WRITE
                | AddWatchFlags::IN_MODIFY
                | AddWatchFlags::IN_ATTRIB
                | AddWatchFlags::IN_CREATE
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_MOVED_FROM
                | AddWatchFlags::IN_MOVED_TO
                | AddWatchFlags::IN_DELETE_SELF
                | AddWatchFlags::IN_MOVE_SELF,
        )?;

        Ok(Self {
            fd: AsyncFd::new(InotifyFd(inotify))?,
            dir,
            name,
        })
    }

    fn relevant(&self, event: &InotifyEvent) -> Result<bool, WatchError> {
        if event.mask.intersects(
            AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF | AddWatchFlags::IN_IGNORED,
        ) {
            return Err(WatchError::DirectoryGone(self.dir.clone()));
        }
        if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            return Ok(true);
        }
        Ok(event.name.as_deref() == Some(self.name.as_os_str()))
    }
}

#[async_trait]
impl ChangeSource for InotifySource {
    async fn wait(&mut self) -> Result<(), WatchError> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.get_inner().0.read_events() {
                Ok(events) => {
                    let mut hit = false;
                    for event in &events {
                        trace!("inotify {:?} {:?}", event.mask, event.name);
                        hit |= self.relevant(event)?;
                    }
                    if hit {
                        return Ok(());
                    }
                }
                Err(Errno::EAGAIN) => guard.clear_ready(),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn name(&self) -> &'static str {
        "inotify"
    }
}
