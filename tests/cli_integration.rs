//! Integration tests for CLI commands.
//!
//! These run the binary against menu files in temporary directories, with
//! the state directory redirected so no daemon of the user is touched.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const MENU: &str = "\
# my menu
items:
  - type: item
    label: Files      # file manager
    cmd: xdg-open ~
  - type: separator
  - type: group
    label: Tools
    items:
      - type: item
        label: Top
        cmd: top
        terminal: true
";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(menu: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("state")).unwrap();
        fs::write(dir.path().join("commands.yaml"), menu).unwrap();
        Self { dir }
    }

    fn config(&self) -> PathBuf {
        self.dir.path().join("commands.yaml")
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("trayrunner").unwrap();
        cmd.env("TRAYRUNNER_STATE_DIR", self.dir.path().join("state"))
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(self.config());
        cmd
    }

    fn backup(&self, stamp: &str) -> PathBuf {
        let path = self.dir.path().join(format!("commands.yaml.bak-{}", stamp));
        fs::write(&path, format!("# backup {}\nitems: []\n", stamp)).unwrap();
        path
    }
}

fn backups_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".bak-"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_help_command() {
    Command::cargo_bin("trayrunner")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon"))
        .stdout(predicate::str::contains("reload"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("backups"));
}

#[test]
fn test_version_command() {
    Command::cargo_bin("trayrunner")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("trayrunner"));
}

#[test]
fn test_validate_ok() {
    let fx = Fixture::new(MENU);
    fx.cmd()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn test_validate_reports_errors() {
    let fx = Fixture::new("items:\n  - type: item\n    label: Broken\n");
    fx.cmd()
        .arg("validate")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("missing required field 'cmd'"));
}

#[test]
fn test_validate_syntax_error() {
    let fx = Fixture::new("items:\n  - type: item\n   label: [unclosed\n");
    fx.cmd()
        .arg("validate")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("OK").not());
}

#[test]
fn test_validate_json() {
    let fx = Fixture::new("items:\n  - type: widget\n");
    let output = fx.cmd().args(["validate", "--json"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["valid"], false);
    assert_eq!(report["errors"].as_array().unwrap().len(), 1);
}

#[test]
fn test_validate_json_includes_warnings() {
    let fx =
        Fixture::new("items:\n  - type: separator\n  - type: item\n    label: a\n    cmd: b\n");
    let output = fx.cmd().args(["validate", "--json"]).output().unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["valid"], true);
    assert!(!report["warnings"].as_array().unwrap().is_empty());
}

#[test]
fn test_validate_missing_file_is_empty_menu() {
    let fx = Fixture::new(MENU);
    fs::remove_file(fx.config()).unwrap();
    fx.cmd()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration has no items"));
}

#[test]
fn test_show_outline() {
    let fx = Fixture::new(MENU);
    fx.cmd()
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("Files -> xdg-open ~"))
        .stdout(predicate::str::contains("Tools/"))
        .stdout(predicate::str::contains("  Top -> top [terminal]"));
}

#[test]
fn test_reload_without_daemon() {
    let fx = Fixture::new(MENU);
    fx.cmd()
        .arg("reload")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not running"));
}

#[test]
fn test_settings_defaults() {
    let fx = Fixture::new(MENU);
    fx.cmd()
        .arg("settings")
        .assert()
        .success()
        .stdout(predicate::str::contains("[reload]"))
        .stdout(predicate::str::contains("coalesce_ms = 250"));
}

#[test]
fn test_invalid_settings_rejected() {
    let fx = Fixture::new(MENU);
    fs::write(fx.dir.path().join("settings.toml"), "[reload]\ncoalesce_ms = 1\n").unwrap();
    fx.cmd().arg("settings").assert().failure();
}

#[test]
fn test_backups_list_newest_first() {
    let fx = Fixture::new(MENU);
    fx.backup("20240101-120000");
    fx.backup("20240301-120000");

    let output = fx.cmd().args(["backups", "list"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let newer = stdout.find("20240301-120000").unwrap();
    let older = stdout.find("20240101-120000").unwrap();
    assert!(newer < older);
}

#[test]
fn test_backups_list_empty() {
    let fx = Fixture::new(MENU);
    fx.cmd()
        .args(["backups", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups"));
}

#[test]
fn test_backups_prune() {
    let fx = Fixture::new(MENU);
    fx.backup("20240101-120000");
    fx.backup("20240201-120000");
    fx.backup("20240301-120000");

    fx.cmd()
        .args(["backups", "prune", "--keep", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 backup(s) removed"));

    assert_eq!(
        backups_in(fx.dir.path()),
        vec!["commands.yaml.bak-20240301-120000".to_string()]
    );
}

#[test]
fn test_backups_restore() {
    let fx = Fixture::new(MENU);
    let copy = fx.backup("20240101-120000");
    fs::write(
        fx.dir.path().join("settings.toml"),
        "[editor]\nreload_after_save = false\n",
    )
    .unwrap();

    fx.cmd()
        .args(["backups", "restore"])
        .arg(&copy)
        .assert()
        .success()
        .stdout(predicate::str::contains("Previous version saved as"));

    assert_eq!(
        fs::read_to_string(fx.config()).unwrap(),
        "# backup 20240101-120000\nitems: []\n"
    );
    // The replaced file was kept as a new backup.
    assert_eq!(backups_in(fx.dir.path()).len(), 2);
}

#[test]
fn test_backups_restore_rejects_foreign_file() {
    let fx = Fixture::new(MENU);
    let other = fx.dir.path().join("other.yaml");
    fs::write(&other, "items: []\n").unwrap();

    fx.cmd()
        .args(["backups", "restore"])
        .arg(&other)
        .assert()
        .failure();
    assert_eq!(fs::read_to_string(fx.config()).unwrap(), MENU);
}
