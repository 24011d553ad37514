//! The long-running menu daemon.
//!
//! One task owns the authoritative configuration. Everything else (socket
//! connections, file watchers, reloads on the blocking pool, front-end
//! commands) reaches it over channels, and the result of every successful
//! reload is published as a new `Arc<Config>` snapshot.

use crate::instance::{self, InstanceError, InstanceLock};
use crate::ipc::{marker, IpcError, ReloadListener, ReloadReply, ReloadScheduler, ReloadSignal};
use crate::menu::Config;
use crate::paths::{PathsError, RuntimePaths};
use crate::platform::{
    notify_in_background, Confirmer, DeclineConfirmer, DesktopNotifier, Notifier, Urgency,
    APP_NAME,
};
use crate::runner::{CommandRunner, ExecLog, ExecutionResult, RunnerOptions};
use crate::settings::Settings;
use crate::store::{self, LoadError};
use crate::watcher::{FileWatcher, Fingerprint, WatchError, WatchHandle, WatchOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Paths error: {0}")]
    Paths(#[from] PathsError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Failed to open execution log {path}: {source}")]
    ExecLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to install signal handler: {0}")]
    Signal(std::io::Error),

    #[error("Daemon not running")]
    Stopped,
}

/// Reads the menu file. The seam exists so front-ends and tests can wrap
/// or replace the store.
pub trait ConfigLoader: Send + Sync + 'static {
    fn load(&self, path: &Path) -> Result<Config, LoadError>;
}

/// The round-trip store.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreLoader;

impl ConfigLoader for StoreLoader {
    fn load(&self, path: &Path) -> Result<Config, LoadError> {
        store::load(path).map(|(config, _)| config)
    }
}

/// Where the daemon gets its collaborators.
#[derive(Clone)]
pub struct Services {
    pub notifier: Arc<dyn Notifier>,
    pub confirmer: Arc<dyn Confirmer>,
    pub loader: Arc<dyn ConfigLoader>,
}

impl Services {
    /// Desktop notifications, no confirmation UI, the YAML store.
    pub fn desktop() -> Self {
        Self {
            notifier: Arc::new(DesktopNotifier::new()),
            confirmer: Arc::new(DeclineConfirmer),
            loader: Arc::new(StoreLoader),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub paths: RuntimePaths,
    pub watch: WatchOptions,
    pub coalesce: Duration,
    pub runner: RunnerOptions,
}

impl DaemonOptions {
    pub fn from_settings(config_path: PathBuf, paths: RuntimePaths, settings: &Settings) -> Self {
        Self {
            config_path,
            paths,
            watch: settings.watch_options(),
            coalesce: settings.coalesce_window(),
            runner: settings.runner_options(),
        }
    }
}

/// Result of activating a menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Launched { pid: u32 },
    Cancelled,
    LaunchFailed { reason: String },
    /// The path does not name an item in the current snapshot.
    NotAnItem,
}

enum Command {
    Activate {
        indices: Vec<usize>,
        reply: oneshot::Sender<Activation>,
    },
    Reload(ReloadSignal),
    Shutdown,
}

/// Front-end access to a running daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    config: watch::Receiver<Arc<Config>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl DaemonHandle {
    /// The current menu snapshot; `changed()` fires after every reload that
    /// altered the tree.
    pub fn config(&self) -> watch::Receiver<Arc<Config>> {
        self.config.clone()
    }

    /// Run the item at `indices` in the current snapshot.
    pub async fn activate(&self, indices: &[usize]) -> Result<Activation, DaemonError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Activate {
                indices: indices.to_vec(),
                reply,
            })
            .map_err(|_| DaemonError::Stopped)?;
        rx.await.map_err(|_| DaemonError::Stopped)
    }

    /// Reload now and wait for the result.
    pub async fn reload(&self) -> Result<ReloadReply, DaemonError> {
        let (signal, rx) = ReloadSignal::new(0);
        self.commands
            .send(Command::Reload(signal))
            .map_err(|_| DaemonError::Stopped)?;
        rx.await.map_err(|_| DaemonError::Stopped)
    }

    /// Ask the loop to stop. Pending reload requests are answered `busy`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct ReloadDone {
    token: u64,
    result: Result<Config, String>,
}

/// Main daemon struct
pub struct Daemon {
    options: DaemonOptions,
    services: Services,
    runner: CommandRunner,
    scheduler: ReloadScheduler<ReloadSignal>,
    snapshot: watch::Sender<Arc<Config>>,
    commands: mpsc::UnboundedReceiver<Command>,
    listener: ReloadListener,
    config_watch: WatchHandle,
    marker_watch: WatchHandle,
    // Dropped last: the socket goes away before the lock is released.
    _lock: InstanceLock,
}

impl Daemon {
    /// Take the instance lock and set everything up. Must be called inside
    /// a tokio runtime.
    ///
    /// Fails only when the state directory, the lock, the execution log, the
    /// socket or a forced native watcher cannot be set up. A broken menu
    /// file is reported and replaced by an empty menu.
    pub fn start(
        options: DaemonOptions,
        services: Services,
    ) -> Result<(Self, DaemonHandle), DaemonError> {
        let paths = &options.paths;
        paths.ensure()?;
        let lock = instance::acquire(paths)?;

        let exec_log_path = paths.exec_log();
        let exec_log = ExecLog::open(&exec_log_path).map_err(|source| DaemonError::ExecLog {
            path: exec_log_path.clone(),
            source,
        })?;
        let runner = CommandRunner::new(
            Arc::new(exec_log),
            Arc::clone(&services.notifier),
            options.runner.clone(),
        );

        let token = current_token(&options.config_path);
        let config = match services.loader.load(&options.config_path) {
            Ok(config) => {
                info!(
                    "Loaded {} ({} items)",
                    options.config_path.display(),
                    config.item_count()
                );
                config
            }
            Err(e) => {
                error!("Failed to load {}: {}", options.config_path.display(), e);
                notify_in_background(
                    &services.notifier,
                    "TrayRunner Error",
                    format!("Configuration error: {}", e),
                    Urgency::Critical,
                );
                Config::default()
            }
        };

        let listener = ReloadListener::bind(&paths.socket())?;
        let config_watch = FileWatcher::spawn(&options.config_path, options.watch)?;
        let marker_watch = FileWatcher::spawn(paths.marker(), options.watch)?;

        let covered = covered_token(&options.config_path, token);
        if let Err(e) = marker::clear_if_covered(&paths.marker(), covered) {
            warn!("Failed to clear reload marker: {}", e);
        }

        let (snapshot, config_rx) = watch::channel(Arc::new(config));
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let daemon = Self {
            scheduler: ReloadScheduler::new(options.coalesce),
            options,
            services,
            runner,
            snapshot,
            commands,
            listener,
            config_watch,
            marker_watch,
            _lock: lock,
        };
        let handle = DaemonHandle {
            config: config_rx,
            commands: commands_tx,
        };
        Ok((daemon, handle))
    }

    /// Main daemon loop. Returns on ctrl-c, SIGTERM or
    /// [`DaemonHandle::shutdown`].
    pub async fn run(mut self) -> Result<(), DaemonError> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
        let (done_tx, mut done_rx) = mpsc::channel::<ReloadDone>(1);

        info!(
            "Daemon running for {} (state in {})",
            self.options.config_path.display(),
            self.options.paths.dir().display()
        );

        loop {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                Some(signal) = self.listener.next() => {
                    self.submit_signal(signal);
                }

                Some(event) = self.config_watch.recv() => {
                    let token = event.fingerprint.map(|f| f.mtime_nanos()).unwrap_or(0);
                    debug!(token, "Configuration file changed");
                    self.scheduler.submit(token, None, Instant::now());
                }

                Some(_) = self.marker_watch.recv() => {
                    if let Some(token) = marker::read(&self.options.paths.marker()) {
                        let token = self.clamp_token(token);
                        debug!(token, "Reload marker found");
                        self.scheduler.submit(token, None, Instant::now());
                    }
                }

                Some(command) = self.commands.recv() => match command {
                    Command::Activate { indices, reply } => {
                        let _ = reply.send(self.activate(&indices));
                    }
                    Command::Reload(signal) => self.submit_signal(signal),
                    Command::Shutdown => {
                        info!("Shutdown requested");
                        break;
                    }
                },

                Some(done) = done_rx.recv() => {
                    self.finish_reload(done);
                }

                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.start_reload(&done_tx);
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }

                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
            }
        }

        for waiter in self.scheduler.drain() {
            waiter.respond(ReloadReply::busy());
        }
        info!("Daemon stopped");
        Ok(())
    }

    fn submit_signal(&mut self, mut signal: ReloadSignal) {
        signal.token = self.clamp_token(signal.token);
        debug!(token = signal.token, "Reload requested");
        self.scheduler
            .submit(signal.token, Some(signal), Instant::now());
    }

    /// A request is about the file as it is now. Legacy requests carry no
    /// token, and a token past the file's modification time (another file,
    /// or a copy with an older mtime moved into place) can never be reached.
    fn clamp_token(&self, token: u64) -> u64 {
        let current = current_token(&self.options.config_path);
        if token == 0 {
            current
        } else {
            token.min(current)
        }
    }

    fn start_reload(&mut self, done_tx: &mpsc::Sender<ReloadDone>) {
        self.scheduler.retain(|signal| !signal.is_closed());
        let token = current_token(&self.options.config_path);
        if !self.scheduler.start(token) {
            return;
        }
        debug!(token, "Reloading configuration");

        let loader = Arc::clone(&self.services.loader);
        let path = self.options.config_path.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || loader.load(&path)).await {
                Ok(loaded) => loaded.map_err(|e| e.to_string()),
                Err(e) => Err(format!("reload task failed: {}", e)),
            };
            let _ = done_tx.send(ReloadDone { token, result }).await;
        });
    }

    fn finish_reload(&mut self, done: ReloadDone) {
        let waiters = self
            .scheduler
            .finish(Instant::now())
            .map(|finished| finished.waiters)
            .unwrap_or_default();

        let reply = match done.result {
            Ok(config) => {
                let items = config.item_count();
                let changed = self.snapshot.send_if_modified(|current| {
                    if **current == config {
                        false
                    } else {
                        *current = Arc::new(config);
                        true
                    }
                });
                info!(token = done.token, items, changed, "Configuration reloaded");
                if changed {
                    notify_in_background(
                        &self.services.notifier,
                        APP_NAME,
                        "Configuration reloaded",
                        Urgency::Normal,
                    );
                }
                ReloadReply::ack(done.token)
            }
            Err(message) => {
                error!(token = done.token, "Reload failed, keeping previous menu: {}", message);
                notify_in_background(
                    &self.services.notifier,
                    "TrayRunner Error",
                    format!("Configuration error: {}", message),
                    Urgency::Critical,
                );
                ReloadReply::error(message)
            }
        };

        let covered = covered_token(&self.options.config_path, done.token);
        if let Err(e) = marker::clear_if_covered(&self.options.paths.marker(), covered) {
            warn!("Failed to clear reload marker: {}", e);
        }
        for waiter in waiters {
            waiter.respond(reply.clone());
        }
    }

    fn activate(&self, indices: &[usize]) -> Activation {
        let config = Arc::clone(&self.snapshot.borrow());
        let Some(item) = config.item_at(indices) else {
            warn!("No item at {:?}", indices);
            return Activation::NotAnItem;
        };

        let confirmer = Arc::clone(&self.services.confirmer);
        match self.runner.run(item, |item| confirmer.confirm(item)) {
            ExecutionResult::Launched { pid, .. } => Activation::Launched { pid },
            ExecutionResult::Cancelled => Activation::Cancelled,
            ExecutionResult::LaunchFailed { reason } => Activation::LaunchFailed { reason },
        }
    }
}

/// Modification time of the menu file in nanoseconds, 0 if it is missing.
fn current_token(config_path: &Path) -> u64 {
    Fingerprint::read(config_path)
        .map(|f| f.mtime_nanos())
        .unwrap_or(0)
}

/// The marker tokens a load at `token` answers. If the file is unchanged
/// since, that load is of the current file and answers every marker.
fn covered_token(config_path: &Path, token: u64) -> u64 {
    if current_token(config_path) == token {
        u64::MAX
    } else {
        token
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Start the daemon with desktop services and run it until it is stopped.
pub async fn run(options: DaemonOptions) -> Result<(), DaemonError> {
    let (daemon, _handle) = Daemon::start(options, Services::desktop())?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{request_reload, ReloadOutcome, ReplyStatus};
    use crate::platform::{AcceptConfirmer, MemoryNotifier};
    use crate::watcher::Backend;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Counts loads and makes each one take a while.
    struct SlowLoader {
        loads: AtomicUsize,
        delay: Duration,
    }

    impl ConfigLoader for SlowLoader {
        fn load(&self, path: &Path) -> Result<Config, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            StoreLoader.load(path)
        }
    }

    struct Fixture {
        dir: TempDir,
        config_path: PathBuf,
        paths: RuntimePaths,
        notifier: Arc<MemoryNotifier>,
    }

    impl Fixture {
        fn new(yaml: &str) -> Self {
            let dir = tempdir().unwrap();
            let config_path = dir.path().join("commands.yaml");
            fs::write(&config_path, yaml).unwrap();
            let paths = RuntimePaths::at(dir.path().join("state"));
            Self {
                dir,
                config_path,
                paths,
                notifier: Arc::new(MemoryNotifier::default()),
            }
        }

        fn options(&self, poll_interval: Duration) -> DaemonOptions {
            DaemonOptions {
                config_path: self.config_path.clone(),
                paths: self.paths.clone(),
                watch: WatchOptions {
                    quiescence: Duration::from_millis(50),
                    poll_interval,
                    backend: Backend::Poll,
                },
                coalesce: Duration::from_millis(50),
                runner: RunnerOptions {
                    notify_on_launch: false,
                    ..RunnerOptions::default()
                },
            }
        }

        fn services(&self, loader: Arc<dyn ConfigLoader>) -> Services {
            Services {
                notifier: self.notifier.clone(),
                confirmer: Arc::new(AcceptConfirmer),
                loader,
            }
        }

        fn start(&self) -> (tokio::task::JoinHandle<Result<(), DaemonError>>, DaemonHandle) {
            let (daemon, handle) = Daemon::start(
                self.options(Duration::from_millis(50)),
                self.services(Arc::new(StoreLoader)),
            )
            .unwrap();
            (tokio::spawn(daemon.run()), handle)
        }

        /// Rewrite the menu file with a strictly newer modification time.
        async fn rewrite(&self, yaml: &str) {
            let before = current_token(&self.config_path);
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                fs::write(&self.config_path, yaml).unwrap();
                if current_token(&self.config_path) > before {
                    return;
                }
            }
        }
    }

    const ONE: &str = "items:\n  - type: item\n    label: One\n    cmd: \"true\"\n";
    const TWO: &str = "items:\n  - type: item\n    label: One\n    cmd: \"true\"\n  - type: item\n    label: Two\n    cmd: \"true\"\n";

    #[tokio::test]
    async fn test_start_publishes_initial_menu() {
        let fx = Fixture::new(ONE);
        let (task, handle) = fx.start();

        assert_eq!(handle.config().borrow().items.len(), 1);
        assert!(instance::is_running(&fx.paths));
        assert!(fx.paths.socket().exists());

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert!(!fx.paths.socket().exists());
        assert!(!instance::is_running(&fx.paths));
    }

    #[tokio::test]
    async fn test_second_daemon_refused() {
        let fx = Fixture::new(ONE);
        let (task, handle) = fx.start();

        let second = Daemon::start(
            fx.options(Duration::from_millis(50)),
            fx.services(Arc::new(StoreLoader)),
        );
        assert!(matches!(
            second,
            Err(DaemonError::Instance(InstanceError::AlreadyRunning { .. }))
        ));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reload_request_acknowledged_after_new_menu() {
        let fx = Fixture::new(ONE);
        let (task, handle) = fx.start();

        fx.rewrite(TWO).await;
        let outcome = request_reload(&fx.paths, &fx.config_path, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, ReloadOutcome::Acknowledged { .. }));
        assert_eq!(handle.config().borrow().items.len(), 2);
        assert!(!fx.paths.marker().exists());

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_watcher_triggers_reload() {
        let fx = Fixture::new(ONE);
        let (task, handle) = fx.start();
        let mut config = handle.config();

        fx.rewrite(TWO).await;
        tokio::time::timeout(Duration::from_secs(5), config.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config.borrow().items.len(), 2);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_menu_keeps_previous_snapshot() {
        let fx = Fixture::new(ONE);
        let (task, handle) = fx.start();

        fx.rewrite("items:\n  - type: item\n    label: Broken\n").await;
        let reply = handle.reload().await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        assert!(reply.error.unwrap().contains("cmd"));
        assert_eq!(handle.config().borrow().items.len(), 1);

        handle.shutdown();
        task.await.unwrap().unwrap();

        let sent = fx.notifier.sent();
        assert!(sent.iter().any(|(_, body, urgency)| {
            body.starts_with("Configuration error") && *urgency == Urgency::Critical
        }));
    }

    #[tokio::test]
    async fn test_burst_during_reload_runs_one_follow_up() {
        let fx = Fixture::new(ONE);
        let loader = Arc::new(SlowLoader {
            loads: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        // Watchers effectively off: only explicit requests reload.
        let (daemon, handle) = Daemon::start(
            fx.options(Duration::from_secs(30)),
            fx.services(loader.clone()),
        )
        .unwrap();
        let task = tokio::spawn(daemon.run());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        fx.rewrite(TWO).await;
        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.reload().await }
        });
        // Let the first reload get going.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        fx.rewrite(ONE).await;
        let burst: Vec<_> = (0..5)
            .map(|_| {
                let paths = fx.paths.clone();
                let config_path = fx.config_path.clone();
                tokio::spawn(async move {
                    request_reload(&paths, &config_path, Duration::from_secs(5)).await
                })
            })
            .collect();

        assert_eq!(first.await.unwrap().unwrap().status, ReplyStatus::Ack);
        for request in burst {
            let outcome = request.await.unwrap().unwrap();
            assert!(matches!(outcome, ReloadOutcome::Acknowledged { .. }));
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
        assert_eq!(handle.config().borrow().items.len(), 1);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_request_for_unreachable_token_settles() {
        let fx = Fixture::new(ONE);
        let loader = Arc::new(SlowLoader {
            loads: AtomicUsize::new(0),
            delay: Duration::from_millis(5),
        });
        let (daemon, handle) = Daemon::start(
            fx.options(Duration::from_secs(30)),
            fx.services(loader.clone()),
        )
        .unwrap();
        let task = tokio::spawn(daemon.run());

        // A sibling file shares the instance but is newer than the menu the
        // daemon reads, so its token is never seen by a load.
        let other = fx.dir.path().join("other.yaml");
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            fs::write(&other, ONE).unwrap();
            if current_token(&other) > current_token(&fx.config_path) {
                break;
            }
        }

        let outcome = request_reload(&fx.paths, &other, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(outcome, ReloadOutcome::Acknowledged { .. }));
        assert!(!fx.paths.marker().exists());

        let settled = loader.loads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(loader.loads.load(Ordering::SeqCst), settled);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_activate_runs_item() {
        let fx = Fixture::new("items: []\n");
        let out = fx.dir.path().join("ran");
        fs::write(
            &fx.config_path,
            format!(
                "items:\n  - type: group\n    label: G\n    items:\n      - type: item\n        label: Touch\n        cmd: \"touch '{}'\"\n",
                out.display()
            ),
        )
        .unwrap();
        let (task, handle) = fx.start();

        let activation = handle.activate(&[0, 0]).await.unwrap();
        assert!(matches!(activation, Activation::Launched { .. }));
        for _ in 0..100 {
            if out.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(out.exists());

        assert_eq!(handle.activate(&[0]).await.unwrap(), Activation::NotAnItem);
        assert_eq!(handle.activate(&[7]).await.unwrap(), Activation::NotAnItem);

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert!(fx.paths.exec_log().exists());
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let fx = Fixture::new(ONE);
        let (task, handle) = fx.start();
        handle.shutdown();
        task.await.unwrap().unwrap();
        assert!(matches!(handle.reload().await, Err(DaemonError::Stopped)));
    }

    #[tokio::test]
    async fn test_startup_clears_stale_marker() {
        let fx = Fixture::new(ONE);
        fx.paths.ensure().unwrap();
        marker::write(&fx.paths.marker(), 1).unwrap();

        let (task, handle) = fx.start();
        assert!(!fx.paths.marker().exists());

        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
