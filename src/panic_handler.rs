//! Crash reports for the daemon.
//!
//! The hook appends the panic message and a backtrace to `crash.log` in the
//! state directory, so crashes of a daemon started from autostart (with
//! nobody watching stderr) can still be diagnosed.

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};

const SEPARATOR: &[u8] = b"\n\n========================================\n\n";

/// Install the panic hook. Reports go to stderr and are appended to
/// `crash_log`, whose directory must already exist.
///
/// Call this early in main(), before spawning anything.
pub fn install(crash_log: PathBuf) {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    panic::set_hook(Box::new(move |info| {
        handle_panic(info, &crash_log);
    }));
}

fn handle_panic(info: &PanicHookInfo, crash_log: &Path) {
    let report = format_crash_report(info);

    // Print to stderr (in case someone is watching)
    eprintln!("{}", report);

    if append_report(crash_log, &report).is_ok() {
        eprintln!("\nCrash report appended to: {}", crash_log.display());
    }
}

fn append_report(path: &Path, report: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(SEPARATOR)?;
    file.write_all(report.as_bytes())?;
    file.flush()
}

fn format_crash_report(info: &PanicHookInfo) -> String {
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown".to_string());

    let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    };

    render_report(&location, &message)
}

fn render_report(location: &str, message: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::force_capture();

    format!(
        r"
================================================================================
TRAYRUNNER CRASH REPORT
================================================================================
Version:  {}
Time:     {}
Thread:   {} ({:?})
Location: {}
Message:  {}

Backtrace:
{}
================================================================================
",
        env!("CARGO_PKG_VERSION"),
        timestamp,
        thread_name,
        thread.id(),
        location,
        message,
        backtrace,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_report_contents() {
        let report = render_report("src/daemon.rs:10:5", "boom");
        assert!(report.contains("TRAYRUNNER CRASH REPORT"));
        assert!(report.contains("Location: src/daemon.rs:10:5"));
        assert!(report.contains("Message:  boom"));
        assert!(report.contains("Backtrace:"));
    }

    #[test]
    fn test_reports_are_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash.log");
        append_report(&path, "first").unwrap();
        append_report(&path, "second").unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.find("first").unwrap() < text.find("second").unwrap());
        assert_eq!(text.matches("========================================\n").count(), 2);
    }
}
