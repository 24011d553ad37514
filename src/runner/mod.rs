//! Running menu items.
//!
//! [`CommandRunner::run`] starts an item and returns at once. A background
//! task waits for the process, keeps the end of its stderr, writes the exit
//! to the execution log and raises a notification if the command failed.
//! Nothing here is fatal to the daemon: every failure is scoped to the one
//! item that caused it.

mod log;
mod terminal;

pub use self::log::ExecLog;
pub use self::terminal::{find_terminal, PathSearch, Terminal, TerminalResolver, DEFAULT_TERMINALS};

use crate::menu::Item;
use crate::platform::{notify_in_background, Notifier, Urgency, APP_NAME};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ERROR_TITLE: &str = "TrayRunner Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Shell,
    Terminal,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Shell => write!(f, "shell"),
            ExecutionMode::Terminal => write!(f, "terminal"),
        }
    }
}

/// One execution log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Launched { pid: u32 },
    /// `code` is `None` when the process was killed by a signal.
    Exited { code: Option<i32> },
    Cancelled,
    LaunchFailed { reason: String },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Launched { pid } => write!(f, "launched pid={}", pid),
            Outcome::Exited { code: Some(code) } => write!(f, "exited code={}", code),
            Outcome::Exited { code: None } => write!(f, "exited code=signal"),
            Outcome::Cancelled => write!(f, "cancelled"),
            Outcome::LaunchFailed { reason } => write!(f, "launch_failed reason={:?}", reason),
        }
    }
}

/// What happened when the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// Last bytes of stderr, trimmed; prefixed with `...` when cut.
    pub stderr_tail: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
pub enum ExecutionResult {
    /// The confirmation gate said no.
    Cancelled,
    /// Running. `wait` resolves when the process exits.
    Launched {
        pid: u32,
        wait: JoinHandle<ExitReport>,
    },
    LaunchFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Emulators tried in order for `terminal: true` items.
    pub terminals: Vec<String>,
    /// How much of a failed command's stderr to keep.
    pub stderr_tail_bytes: usize,
    /// Show "Started: <label>" when an item launches.
    pub notify_on_launch: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            terminals: DEFAULT_TERMINALS.iter().map(|s| s.to_string()).collect(),
            stderr_tail_bytes: 200,
            notify_on_launch: true,
        }
    }
}

/// Launches items. Cheap to clone; clones share the log and notifier.
#[derive(Clone)]
pub struct CommandRunner {
    log: Arc<ExecLog>,
    notifier: Arc<dyn Notifier>,
    resolver: Arc<dyn TerminalResolver>,
    options: Arc<RunnerOptions>,
}

impl CommandRunner {
    pub fn new(log: Arc<ExecLog>, notifier: Arc<dyn Notifier>, options: RunnerOptions) -> Self {
        Self {
            log,
            notifier,
            resolver: Arc::new(PathSearch),
            options: Arc::new(options),
        }
    }

    /// Use `resolver` instead of `$PATH` to find terminal emulators.
    pub fn with_resolver(mut self, resolver: impl TerminalResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Start `item`. Must be called inside a tokio runtime.
    ///
    /// `confirm` is only consulted for items with `confirm: true`.
    pub fn run<F>(&self, item: &Item, confirm: F) -> ExecutionResult
    where
        F: FnOnce(&Item) -> bool,
    {
        let mode = if item.terminal {
            ExecutionMode::Terminal
        } else {
            ExecutionMode::Shell
        };

        if item.confirm && !confirm(item) {
            info!(label = %item.label, "Execution cancelled");
            self.log.record(mode, &Outcome::Cancelled, &item.label, &item.cmd);
            return ExecutionResult::Cancelled;
        }

        let mut command = match self.command_for(item) {
            Ok(command) => command,
            Err(reason) => return self.launch_failed(item, mode, reason),
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(match mode {
                ExecutionMode::Shell => Stdio::piped(),
                ExecutionMode::Terminal => Stdio::null(),
            })
            .envs(&item.env)
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return self.launch_failed(item, mode, format!("Failed to spawn: {}", e)),
        };
        let pid = child.id().unwrap_or(0);

        info!(pid, label = %item.label, %mode, "Launched");
        self.log
            .record(mode, &Outcome::Launched { pid }, &item.label, &item.cmd);
        if self.options.notify_on_launch {
            self.notify(APP_NAME, format!("Started: {}", item.label), Urgency::Normal);
        }

        let stderr = child.stderr.take();
        let runner = self.clone();
        let label = item.label.clone();
        let cmd = item.cmd.clone();
        let wait =
            tokio::spawn(async move { runner.wait_for(child, stderr, mode, label, cmd).await });

        ExecutionResult::Launched { pid, wait }
    }

    fn command_for(&self, item: &Item) -> Result<Command, String> {
        if item.terminal {
            let terminal = find_terminal(self.resolver.as_ref(), &self.options.terminals)
                .ok_or_else(|| "No terminal emulator found".to_string())?;
            debug!("Using terminal {} ({})", terminal.name, terminal.program.display());
            let mut command = Command::new(&terminal.program);
            command.args(terminal.args(&item.cmd));
            Ok(command)
        } else {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&item.cmd);
            Ok(command)
        }
    }

    fn launch_failed(&self, item: &Item, mode: ExecutionMode, reason: String) -> ExecutionResult {
        warn!(label = %item.label, "Launch failed: {}", reason);
        let outcome = Outcome::LaunchFailed {
            reason: reason.clone(),
        };
        self.log.record(mode, &outcome, &item.label, &item.cmd);
        self.notify(
            ERROR_TITLE,
            format!("Failed to execute: {}\n{}", item.label, reason),
            Urgency::Critical,
        );
        ExecutionResult::LaunchFailed { reason }
    }

    async fn wait_for(
        self,
        mut child: Child,
        stderr: Option<ChildStderr>,
        mode: ExecutionMode,
        label: String,
        cmd: String,
    ) -> ExitReport {
        let limit = self.options.stderr_tail_bytes;
        let tail = async move {
            match stderr {
                Some(stderr) => read_tail(stderr, limit).await,
                None => String::new(),
            }
        };
        let (status, stderr_tail) = tokio::join!(child.wait(), tail);

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(label = %label, "Failed to wait for process: {}", e);
                None
            }
        };
        let report = ExitReport { code, stderr_tail };

        self.log.record(mode, &Outcome::Exited { code }, &label, &cmd);
        if report.success() {
            info!(label = %label, "Command finished");
        } else {
            warn!(label = %label, code = ?code, "Command failed");
            let _ = self
                .notify(ERROR_TITLE, failure_body(&label, &report), Urgency::Critical)
                .await;
        }
        report
    }

    fn notify(&self, title: &str, body: String, urgency: Urgency) -> JoinHandle<()> {
        notify_in_background(&self.notifier, title, body, urgency)
    }
}

fn failure_body(label: &str, report: &ExitReport) -> String {
    let status = match report.code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    };
    if report.stderr_tail.is_empty() {
        format!("Command failed: {} ({})", label, status)
    } else {
        format!("Command failed: {} ({})\n{}", label, status, report.stderr_tail)
    }
}

/// Drain `stderr`, keeping at most `limit` trailing bytes.
async fn read_tail(mut stderr: ChildStderr, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let cut = tail.len() - limit;
                    tail.drain(..cut);
                    truncated = true;
                }
            }
            Err(e) => {
                debug!("stderr read error: {}", e);
                break;
            }
        }
    }
    let text = String::from_utf8_lossy(&tail).trim().to_string();
    if truncated {
        format!("...{}", text)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryNotifier;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixed(HashMap<String, PathBuf>);

    impl TerminalResolver for Fixed {
        fn resolve(&self, name: &str) -> Option<PathBuf> {
            self.0.get(name).cloned()
        }
    }

    struct Harness {
        dir: TempDir,
        notifier: Arc<MemoryNotifier>,
        runner: CommandRunner,
    }

    impl Harness {
        fn new(options: RunnerOptions) -> Self {
            let dir = tempdir().unwrap();
            let log = Arc::new(ExecLog::open(&dir.path().join("run.log")).unwrap());
            let notifier = Arc::new(MemoryNotifier::default());
            let runner = CommandRunner::new(log, notifier.clone(), options)
                .with_resolver(Fixed(HashMap::new()));
            Self {
                dir,
                notifier,
                runner,
            }
        }

        fn quiet() -> Self {
            Self::new(RunnerOptions {
                notify_on_launch: false,
                ..RunnerOptions::default()
            })
        }

        fn log_lines(&self) -> Vec<String> {
            fs::read_to_string(self.dir.path().join("run.log"))
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }

        async fn notifications(&self, at_least: usize) -> Vec<(String, String, Urgency)> {
            for _ in 0..100 {
                let sent = self.notifier.sent();
                if sent.len() >= at_least {
                    return sent;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.notifier.sent()
        }
    }

    async fn finish(result: ExecutionResult) -> ExitReport {
        match result {
            ExecutionResult::Launched { wait, .. } => wait.await.unwrap(),
            other => panic!("Expected Launched, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_item_with_env_overlay() {
        let h = Harness::quiet();
        let out = h.dir.path().join("out.txt");
        let mut item = Item::new(
            "Greet",
            format!("printf '%s' \"$GREETING\" > '{}'", out.display()),
        );
        item.env.insert("GREETING".to_string(), "hello there".to_string());

        let report = finish(h.runner.run(&item, |_| unreachable!())).await;
        assert!(report.success());
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello there");

        let lines = h.log_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("mode=shell outcome=launched pid="));
        assert!(lines[1].contains("outcome=exited code=0 label=\"Greet\""));
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_stderr_and_notifies() {
        let h = Harness::quiet();
        let item = Item::new("Broken", "echo 'disk full' >&2; exit 3");

        let report = finish(h.runner.run(&item, |_| true)).await;
        assert_eq!(report.code, Some(3));
        assert_eq!(report.stderr_tail, "disk full");

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ERROR_TITLE);
        assert!(sent[0].1.contains("Command failed: Broken (exit code 3)"));
        assert!(sent[0].1.ends_with("disk full"));
        assert_eq!(sent[0].2, Urgency::Critical);
        assert!(h.log_lines()[1].contains("outcome=exited code=3"));
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let h = Harness::new(RunnerOptions {
            stderr_tail_bytes: 16,
            notify_on_launch: false,
            ..RunnerOptions::default()
        });
        let item = Item::new(
            "Noisy",
            "i=0; while [ $i -lt 200 ]; do echo line$i >&2; i=$((i+1)); done; exit 1",
        );

        let report = finish(h.runner.run(&item, |_| true)).await;
        assert!(report.stderr_tail.starts_with("..."));
        assert!(report.stderr_tail.ends_with("line199"));
        assert!(report.stderr_tail.len() <= 16 + 3);
    }

    #[tokio::test]
    async fn test_declined_confirmation() {
        let h = Harness::quiet();
        let mut item = Item::new("Reboot", "touch should-not-exist");
        item.confirm = true;

        let mut asked = false;
        let result = h.runner.run(&item, |i| {
            asked = true;
            assert_eq!(i.label, "Reboot");
            false
        });
        assert!(matches!(result, ExecutionResult::Cancelled));
        assert!(asked);

        let lines = h.log_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("outcome=cancelled"));
    }

    #[tokio::test]
    async fn test_accepted_confirmation_runs() {
        let h = Harness::quiet();
        let mut item = Item::new("Ok", "true");
        item.confirm = true;
        assert!(finish(h.runner.run(&item, |_| true)).await.success());
    }

    #[tokio::test]
    async fn test_no_terminal_is_launch_failure() {
        let h = Harness::quiet();
        let mut item = Item::new("Top", "htop");
        item.terminal = true;

        match h.runner.run(&item, |_| true) {
            ExecutionResult::LaunchFailed { reason } => {
                assert_eq!(reason, "No terminal emulator found")
            }
            other => panic!("Expected LaunchFailed, got {:?}", other),
        }
        assert!(h.log_lines()[0].contains("mode=terminal outcome=launch_failed"));

        let sent = h.notifications(1).await;
        assert!(sent[0].1.starts_with("Failed to execute: Top"));
    }

    fn fake_terminal(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        // Drops the leading "-e" and runs the rest.
        let path = dir.join("fake-term");
        fs::write(&path, "#!/bin/sh\nshift\nexec \"$@\"\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_terminal_gets_command_as_one_argument() {
        let dir = tempdir().unwrap();
        let term = fake_terminal(dir.path());
        let out = dir.path().join("args.txt");

        let log = Arc::new(ExecLog::open(&dir.path().join("run.log")).unwrap());
        let runner = CommandRunner::new(
            log,
            Arc::new(MemoryNotifier::default()),
            RunnerOptions {
                terminals: vec!["missing-term".to_string(), "fake-term".to_string()],
                notify_on_launch: false,
                ..RunnerOptions::default()
            },
        )
        .with_resolver(Fixed(HashMap::from([("fake-term".to_string(), term)])));

        let mut item = Item::new("Args", format!("echo one two > '{}'", out.display()));
        item.terminal = true;

        let report = finish(runner.run(&item, |_| true)).await;
        assert!(report.success());
        assert_eq!(fs::read_to_string(&out).unwrap(), "one two\n");
    }

    #[tokio::test]
    async fn test_launch_notification() {
        let h = Harness::new(RunnerOptions::default());
        let item = Item::new("Hello", "true");
        finish(h.runner.run(&item, |_| true)).await;

        let sent = h.notifications(1).await;
        assert_eq!(sent[0].0, APP_NAME);
        assert_eq!(sent[0].1, "Started: Hello");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Launched { pid: 3 }.to_string(), "launched pid=3");
        assert_eq!(Outcome::Exited { code: None }.to_string(), "exited code=signal");
        assert_eq!(
            Outcome::LaunchFailed {
                reason: "no \"x\"".to_string()
            }
            .to_string(),
            "launch_failed reason=\"no \\\"x\\\"\""
        );
    }
}
