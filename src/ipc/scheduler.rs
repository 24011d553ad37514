//! Reload coalescing.
//!
//! ```text
//! Idle --submit--> Pending --deadline/start--> Running --finish--> Idle
//!                     ^                           |
//!                     +------ newer token --------+
//! ```
//!
//! Every request carries a token (the file's modification time as the
//! writer saw it). A running reload answers every request whose token is not
//! newer than the one it read; anything newer gets exactly one follow-up.
//! The follow-up answers everyone it was scheduled for, whatever it reads:
//! it started after their requests arrived, so nothing later can serve them
//! better, and a token no reload can reach must not keep the daemon busy.

use std::mem;
use std::time::{Duration, Instant};

/// Default coalescing window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(250);

enum State<W> {
    Idle,
    Pending {
        deadline: Instant,
        waiters: Vec<(u64, W)>,
        follow_up: bool,
    },
    Running {
        token: u64,
        waiters: Vec<W>,
        next: Vec<(u64, W)>,
        rerun: bool,
    },
}

/// Outcome of a finished reload: who it answers.
#[derive(Debug)]
pub struct Finished<W> {
    pub token: u64,
    pub waiters: Vec<W>,
}

/// Turns reload requests into as few reloads as possible.
///
/// `W` is whatever the caller needs to answer a request later, typically a
/// reply channel.
pub struct ReloadScheduler<W> {
    window: Duration,
    state: State<W>,
}

impl<W> ReloadScheduler<W> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: State::Idle,
        }
    }

    /// Register a request. `waiter` is `None` for requests nobody answers,
    /// such as file watcher events.
    pub fn submit(&mut self, token: u64, waiter: Option<W>, now: Instant) {
        if let State::Idle = self.state {
            self.state = State::Pending {
                deadline: now + self.window,
                waiters: Vec::new(),
                follow_up: false,
            };
        }

        match &mut self.state {
            State::Idle => {}
            State::Pending { waiters, .. } => waiters.extend(waiter.map(|w| (token, w))),
            State::Running {
                token: running,
                waiters,
                next,
                rerun,
            } => {
                if token <= *running {
                    waiters.extend(waiter);
                } else {
                    next.extend(waiter.map(|w| (token, w)));
                    *rerun = true;
                }
            }
        }
    }

    /// When the pending reload should start. `None` unless one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Pending { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// Start the pending reload, which read the file at `token`. Returns
    /// `false` if nothing was pending.
    pub fn start(&mut self, token: u64) -> bool {
        match mem::replace(&mut self.state, State::Idle) {
            State::Pending {
                waiters, follow_up, ..
            } => {
                let (covered, next): (Vec<_>, Vec<_>) = waiters
                    .into_iter()
                    .partition(|(t, _)| follow_up || *t <= token);
                self.state = State::Running {
                    token,
                    waiters: covered.into_iter().map(|(_, w)| w).collect(),
                    rerun: !next.is_empty(),
                    next,
                };
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    /// Mark the running reload complete. A follow-up, if any, becomes due
    /// immediately.
    pub fn finish(&mut self, now: Instant) -> Option<Finished<W>> {
        match mem::replace(&mut self.state, State::Idle) {
            State::Running {
                token,
                waiters,
                next,
                rerun,
            } => {
                if rerun {
                    self.state = State::Pending {
                        deadline: now,
                        waiters: next,
                        follow_up: true,
                    };
                }
                Some(Finished { token, waiters })
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Forget the waiters `keep` rejects, such as clients that hung up.
    pub fn retain(&mut self, mut keep: impl FnMut(&W) -> bool) {
        match &mut self.state {
            State::Idle => {}
            State::Pending { waiters, .. } => waiters.retain(|(_, w)| keep(w)),
            State::Running { waiters, next, .. } => {
                waiters.retain(|w| keep(w));
                next.retain(|(_, w)| keep(w));
            }
        }
    }

    /// Drop all state, returning every waiter that has not been answered.
    pub fn drain(&mut self) -> Vec<W> {
        match mem::replace(&mut self.state, State::Idle) {
            State::Idle => Vec::new(),
            State::Pending { waiters, .. } => waiters.into_iter().map(|(_, w)| w).collect(),
            State::Running { waiters, next, .. } => waiters
                .into_iter()
                .chain(next.into_iter().map(|(_, w)| w))
                .collect(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }
}

impl<W> Default for ReloadScheduler<W> {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
