use super::{ChangeSource, Fingerprint, WatchError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Compares the file's [`Fingerprint`] at a fixed interval.
pub struct PollSource {
    path: PathBuf,
    ticker: Interval,
    seen: Option<Fingerprint>,
}

impl PollSource {
    /// Must be called inside a tokio runtime.
    pub fn new(path: &Path, every: Duration) -> Self {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            path: path.to_path_buf(),
            ticker,
            seen: Fingerprint::read(path),
        }
    }
}

#[async_trait]
impl ChangeSource for PollSource {
    async fn wait(&mut self) -> Result<(), WatchError> {
        loop {
            self.ticker.tick().await;
            let current = Fingerprint::read(&self.path);
            if current != self.seen {
                self.seen = current;
                return Ok(());
            }
        }
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
