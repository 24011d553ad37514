//! TrayRunner: a tray command menu driven by a YAML file.
//!
//! The library holds everything the daemon, the CLI and external front-ends
//! (tray renderers, visual editors) share: the menu model and its validator,
//! the comment-preserving store, backups, the single-instance guard, the
//! file watcher, reload signalling and the command runner.

#[cfg(not(unix))]
compile_error!("trayrunner relies on flock, unix sockets and process groups; only unix targets are supported");

pub mod backup;
pub mod daemon;
pub mod instance;
pub mod ipc;
pub mod menu;
pub mod panic_handler;
pub mod paths;
pub mod platform;
pub mod runner;
pub mod settings;
pub mod store;
pub mod watcher;

// Re-export commonly used types for convenience
pub use menu::{Config, Group, Item, MenuNode};
pub use settings::Settings;
pub use store::ConfigSession;
