use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use trayrunner::daemon::{self, DaemonOptions};
use trayrunner::ipc::{self, ReloadOutcome};
use trayrunner::menu::{self, lint::lint, ValidationError};
use trayrunner::paths::{self, RuntimePaths};
use trayrunner::store::{self, LoadError};
use trayrunner::{backup, panic_handler, Settings};

/// Exit codes of `trayrunner reload`.
const EXIT_NOT_RUNNING: i32 = 2;
const EXIT_TIMEOUT: i32 = 3;
const EXIT_REJECTED: i32 = 4;

#[derive(Parser)]
#[command(name = "trayrunner")]
#[command(
    author,
    version,
    about = "Tray command menu with live-reloading YAML config",
    long_about = None
)]
struct Cli {
    /// Menu file (default: $XDG_CONFIG_HOME/trayrunner/commands.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground (default)
    Daemon,

    /// Ask the running daemon to reload the menu file
    Reload,

    /// Check the menu file and report problems
    Validate {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Print the menu tree
    Show,

    /// Manage backups of the menu file
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Print the effective settings
    Settings,
}

#[derive(Subcommand)]
enum BackupAction {
    /// List backups, newest first
    List,

    /// Replace the menu file with a backup (the current file is backed up first)
    Restore {
        /// Backup file, as printed by `backups list`
        backup: PathBuf,
    },

    /// Delete all but the newest backups
    Prune {
        /// Number of backups to keep
        #[arg(short, long, default_value_t = 10)]
        keep: usize,
    },
}

/// Log file for the daemon, and whether it is written as JSON lines.
struct LogFile<'a> {
    path: &'a Path,
    json: bool,
}

fn init_logging(verbose: bool, level: &str, log_file: Option<LogFile<'_>>) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("trayrunner=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("trayrunner={}", level)))
    };

    let target = log_file.and_then(|f| Some((f.path.parent()?, f.path.file_name()?, f.json)));
    let (file_layer, guard) = match target {
        Some((dir, name, json)) => {
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            let layer = if json {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => paths::default_config_path()?,
    };
    let settings = Settings::load_for(&config_path)?;

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let runtime = RuntimePaths::for_config(&config_path)?;
            runtime.ensure()?;
            panic_handler::install(runtime.crash_log());

            let daemon_log = runtime.daemon_log();
            let log_file = settings.logging.file.then(|| LogFile {
                path: &daemon_log,
                json: settings.logging.json,
            });
            let _guard = init_logging(cli.verbose, &settings.logging.level, log_file);

            info!("Starting TrayRunner daemon v{}", env!("CARGO_PKG_VERSION"));
            let options = DaemonOptions::from_settings(config_path, runtime, &settings);
            daemon::run(options).await?;
        }

        Commands::Reload => {
            init_logging(cli.verbose, "warn", None);
            let runtime = RuntimePaths::for_config(&config_path)?;
            let outcome =
                ipc::request_reload(&runtime, &config_path, settings.reload_timeout()).await?;
            process::exit(report_reload(&outcome));
        }

        Commands::Validate { json } => {
            init_logging(cli.verbose, "warn", None);
            let valid = validate(&config_path, json)?;
            if !valid {
                process::exit(1);
            }
        }

        Commands::Show => {
            init_logging(cli.verbose, "warn", None);
            let (config, _) = store::load(&config_path)
                .with_context(|| format!("Failed to load {}", config_path.display()))?;
            let mut out = String::new();
            menu::write_outline(&config, &mut out)?;
            print!("{}", out);
        }

        Commands::Backups { action } => {
            init_logging(cli.verbose, "warn", None);
            backups(action, &config_path, &settings).await?;
        }

        Commands::Settings => {
            init_logging(cli.verbose, "warn", None);
            println!("# {}", paths::settings_path_for(&config_path).display());
            print!("{}", settings.to_toml()?);
        }
    }

    Ok(())
}

fn report_reload(outcome: &ReloadOutcome) -> i32 {
    match outcome {
        ReloadOutcome::Acknowledged { .. } => {
            println!("Reloaded");
            0
        }
        ReloadOutcome::NotRunning => {
            eprintln!("Daemon not running");
            EXIT_NOT_RUNNING
        }
        ReloadOutcome::Timeout => {
            eprintln!("Timed out waiting for the daemon");
            EXIT_TIMEOUT
        }
        ReloadOutcome::Rejected { message } => {
            eprintln!("Reload rejected: {}", message);
            EXIT_REJECTED
        }
    }
}

/// Print the result of validating `path`. Returns whether the file is valid.
fn validate(path: &Path, json: bool) -> anyhow::Result<bool> {
    let (valid, errors, problem, lints) = match store::load(path) {
        Ok((config, _)) => (true, Vec::new(), None, lint(&config)),
        Err(LoadError::Invalid { errors }) => (false, errors, None, Vec::new()),
        Err(e @ LoadError::Io { .. }) => return Err(e.into()),
        Err(other) => (false, Vec::new(), Some(other.to_string()), Vec::new()),
    };

    if json {
        let report = serde_json::json!({
            "path": path,
            "valid": valid,
            "error": problem,
            "errors": errors,
            "warnings": lints,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(valid);
    }

    if let Some(problem) = &problem {
        println!("{}: {}", path.display(), problem);
    }
    print_errors(path, &errors);
    for warning in &lints {
        println!("warning: {}", warning);
    }
    if valid {
        println!("{}: OK", path.display());
    }
    Ok(valid)
}

fn print_errors(path: &Path, errors: &[ValidationError]) {
    for error in errors {
        println!("{}: {}", path.display(), error);
    }
}

async fn backups(
    action: BackupAction,
    config_path: &Path,
    settings: &Settings,
) -> anyhow::Result<()> {
    match action {
        BackupAction::List => {
            let records = backup::list(config_path)?;
            if records.is_empty() {
                println!("No backups of {}", config_path.display());
            }
            for record in records {
                println!(
                    "{}  {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.copy.display()
                );
            }
        }

        BackupAction::Restore { backup: copy } => {
            let saved = backup::restore(config_path, &copy)?;
            println!("Restored {} from {}", config_path.display(), copy.display());
            if let Some(record) = saved {
                println!("Previous version saved as {}", record.copy.display());
            }

            if settings.editor.reload_after_save {
                let runtime = RuntimePaths::for_config(config_path)?;
                let outcome =
                    ipc::request_reload(&runtime, config_path, settings.reload_timeout()).await?;
                println!("Reload: {}", outcome);
            }
        }

        BackupAction::Prune { keep } => {
            let removed = backup::prune(config_path, keep)?;
            for path in &removed {
                println!("Removed {}", path.display());
            }
            println!("{} backup(s) removed", removed.len());
        }
    }
    Ok(())
}
