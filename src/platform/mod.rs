//! Desktop integration seams.
//!
//! The daemon talks to the desktop through two traits: [`Notifier`] for
//! pop-up messages and [`Confirmer`] for asking before running an item.
//! Front-ends supply their own implementations; the defaults here use
//! `notify-rust` and decline every confirmation.

use crate::menu::Item;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Application name shown by notification daemons.
pub const APP_NAME: &str = "TrayRunner";

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Notification error: {0}")]
    Notification(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    Critical,
}

/// Trait for showing notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str, urgency: Urgency) -> Result<(), PlatformError>;
}

/// Trait for asking the user before an item runs
pub trait Confirmer: Send + Sync {
    fn confirm(&self, item: &Item) -> bool;
}

/// Show a notification from async code. Notifiers may block on the session
/// bus, so the call runs on the blocking pool; failures are only logged.
pub fn notify_in_background(
    notifier: &Arc<dyn Notifier>,
    title: impl Into<String>,
    body: impl Into<String>,
    urgency: Urgency,
) -> JoinHandle<()> {
    let notifier = Arc::clone(notifier);
    let title = title.into();
    let body = body.into();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = notifier.notify(&title, &body, urgency) {
            warn!("{}", e);
        }
    })
}

/// Detect the current display environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayServer {
    X11,
    Wayland,
    MacOS,
    Tty,
    Unknown,
}

impl DisplayServer {
    pub fn detect() -> Self {
        #[cfg(target_os = "macos")]
        {
            DisplayServer::MacOS
        }

        #[cfg(not(target_os = "macos"))]
        {
            if std::env::var_os("WAYLAND_DISPLAY").is_some() {
                return DisplayServer::Wayland;
            }
            if std::env::var_os("DISPLAY").is_some() {
                return DisplayServer::X11;
            }
            if std::env::var_os("TERM").is_some() {
                return DisplayServer::Tty;
            }
            DisplayServer::Unknown
        }
    }

    pub fn is_graphical(self) -> bool {
        matches!(
            self,
            DisplayServer::X11 | DisplayServer::Wayland | DisplayServer::MacOS
        )
    }
}

/// Desktop notifications through the session's notification daemon.
#[derive(Debug, Clone, Copy)]
pub struct DesktopNotifier {
    display_server: DisplayServer,
}

impl DesktopNotifier {
    pub fn new() -> Self {
        Self {
            display_server: DisplayServer::detect(),
        }
    }
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, body: &str, urgency: Urgency) -> Result<(), PlatformError> {
        if !self.display_server.is_graphical() {
            // No notifications without a graphical session
            debug!("Notification (no display): {}: {}", title, body);
            return Ok(());
        }

        let mut notification = notify_rust::Notification::new();
        notification.summary(title).body(body).appname(APP_NAME);

        #[cfg(all(unix, not(target_os = "macos")))]
        notification.urgency(match urgency {
            Urgency::Normal => notify_rust::Urgency::Normal,
            Urgency::Critical => notify_rust::Urgency::Critical,
        });
        #[cfg(target_os = "macos")]
        let _ = urgency;

        notification
            .show()
            .map_err(|e| PlatformError::Notification(e.to_string()))?;
        Ok(())
    }
}

/// Writes notifications to the log instead of the desktop.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str, urgency: Urgency) -> Result<(), PlatformError> {
        match urgency {
            Urgency::Normal => info!("{}: {}", title, body),
            Urgency::Critical => warn!("{}: {}", title, body),
        }
        Ok(())
    }
}

/// Keeps every notification in memory. For front-ends that show their own
/// history, and for tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(String, String, Urgency)>>,
}

impl MemoryNotifier {
    pub fn sent(&self) -> Vec<(String, String, Urgency)> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, title: &str, body: &str, urgency: Urgency) -> Result<(), PlatformError> {
        let mut sent = match self.sent.lock() {
            Ok(sent) => sent,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push((title.to_string(), body.to_string(), urgency));
        Ok(())
    }
}

/// Headless default: there is nobody to ask, so the answer is no.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineConfirmer;

impl Confirmer for DeclineConfirmer {
    fn confirm(&self, item: &Item) -> bool {
        info!("No confirmation UI, declining '{}'", item.label);
        false
    }
}

/// Answers every confirmation with yes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptConfirmer;

impl Confirmer for AcceptConfirmer {
    fn confirm(&self, _item: &Item) -> bool {
        true
    }
}
