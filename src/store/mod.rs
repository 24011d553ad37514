//! Loading and saving the menu file without losing what the author wrote.
//!
//! [`load`] keeps the original text next to the validated tree in a
//! [`FormatState`]. [`save`] compares the tree being saved with that
//! baseline: an unchanged tree is written back verbatim, an edited one by
//! patching only the affected lines. When patching is not possible, or the
//! patched text does not read back as exactly the requested tree, the file
//! is written in canonical block style instead.

mod atomic;
mod layout;
mod render;
mod session;

pub use atomic::write_atomic;
pub use session::ConfigSession;

use crate::backup::{self, BackupError, BackupRecord};
use crate::menu::{validate, Config, MenuNode, SchemaError, ValidationError, MAX_RENDER_DEPTH};
use crate::watcher::Fingerprint;
use serde_yaml::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("YAML parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Configuration root must be a mapping, found {actual}")]
    NotAMapping { actual: &'static str },

    #[error(
        "Configuration has {} validation error(s), first: {}",
        .errors.len(),
        first_message(.errors)
    )]
    Invalid { errors: Vec<ValidationError> },
}

fn first_message(errors: &[ValidationError]) -> String {
    errors.first().map(ToString::to_string).unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Refusing to save invalid configuration ({} error(s))", .errors.len())]
    Invalid { errors: Vec<ValidationError> },

    #[error("Menu nesting exceeds {limit} levels")]
    TooDeep { limit: usize },

    #[error("Backup failed, save aborted: {0}")]
    Backup(#[from] BackupError),

    #[error("Failed to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl From<SchemaError> for LoadError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::NotAMapping { actual } => LoadError::NotAMapping { actual },
            SchemaError::Invalid(errors) => LoadError::Invalid { errors },
        }
    }
}

impl From<serde_yaml::Error> for LoadError {
    fn from(err: serde_yaml::Error) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));
        LoadError::Parse {
            line,
            column,
            message: err.to_string(),
        }
    }
}

/// The original text of a loaded file and the tree it parsed to.
#[derive(Debug, Clone, Default)]
pub struct FormatState {
    source: Option<Source>,
}

#[derive(Debug, Clone)]
struct Source {
    text: String,
    baseline: Config,
}

impl FormatState {
    fn from_text(text: String, baseline: Config) -> Self {
        Self {
            source: Some(Source { text, baseline }),
        }
    }

    /// Original text, if the state came from a file.
    pub fn text(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.text.as_str())
    }
}

/// How [`save`] produced the written text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// Unchanged tree, original bytes.
    Verbatim,
    /// Original text with the edited lines rewritten.
    Patched,
    /// Fresh block-style rendering.
    Canonical,
}

#[derive(Debug, Clone)]
pub struct SaveReport {
    pub backup: Option<BackupRecord>,
    pub format: SaveFormat,
    /// Baseline for the next edit.
    pub state: FormatState,
    /// Identity of the file just written, for suppressing its own change event.
    pub fingerprint: Option<Fingerprint>,
}

/// Read and validate the configuration at `path`.
///
/// A missing file is the empty configuration.
pub fn load(path: &Path) -> Result<(Config, FormatState), LoadError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} does not exist, using empty configuration", path.display());
            return Ok((Config::default(), FormatState::default()));
        }
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let (config, state) = parse_document(text)?;
    debug!(
        "Loaded {} ({} items) from {}",
        config.items.len(),
        config.item_count(),
        path.display()
    );
    Ok((config, state))
}

/// Parse `text` and keep it as the layout for later saves.
pub fn parse_document(text: String) -> Result<(Config, FormatState), LoadError> {
    let config = parse(&text)?;
    Ok((config.clone(), FormatState::from_text(text, config)))
}

/// Parse and validate configuration text.
pub fn parse(text: &str) -> Result<Config, LoadError> {
    let document: Value = if layout::is_blank_document(text) {
        Value::Null
    } else {
        serde_yaml::from_str(text)?
    };
    Ok(validate(&document)?)
}

/// Write `config` to `path`, backing up the current file first.
///
/// The tree is checked before anything touches the disk. A failed backup
/// aborts the save.
pub fn save(path: &Path, config: &Config, state: &FormatState) -> Result<SaveReport, SaveError> {
    let errors = config.check();
    if !errors.is_empty() {
        return Err(SaveError::Invalid { errors });
    }
    if depth(&config.items) > MAX_RENDER_DEPTH {
        return Err(SaveError::TooDeep {
            limit: MAX_RENDER_DEPTH,
        });
    }

    let (text, format) = render_text(config, state);
    let backup = backup::create(path)?;
    write_atomic(path, text.as_bytes()).map_err(|source| SaveError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Saved {} ({:?})", path.display(), format);
    Ok(SaveReport {
        backup,
        format,
        state: FormatState::from_text(text, config.clone()),
        fingerprint: Fingerprint::read(path),
    })
}

/// Produce the text [`save`] would write.
pub fn render_text(config: &Config, state: &FormatState) -> (String, SaveFormat) {
    if let Some(source) = &state.source {
        if source.baseline == *config {
            return (source.text.clone(), SaveFormat::Verbatim);
        }
        match render::patch(&source.text, &source.baseline, config) {
            Some(text) if matches!(parse(&text), Ok(ref reread) if reread == config) => {
                return (text, SaveFormat::Patched);
            }
            Some(_) => warn!(
                "Patched text did not read back as the edited menu, writing canonical layout"
            ),
            None => debug!("Layout is not patchable, writing canonical layout"),
        }
    }
    (render::canonical(config), SaveFormat::Canonical)
}

fn depth(nodes: &[MenuNode]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            MenuNode::Group(group) => 1 + depth(&group.items),
            _ => 1,
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::{Group, Item};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    const COMMENTED: &str = "\
# Launcher menu
items:
  - type: item
    label: Files      # file manager
    cmd: nautilus
  # tools below
  - type: group
    label: Tools
    items:
      - type: item
        label: Top
        cmd: htop
        terminal: true
";

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = tempdir().unwrap();
        let (config, state) = load(&dir.path().join("commands.yaml")).unwrap();
        assert_eq!(config, Config::default());
        assert!(state.text().is_none());
    }

    #[test]
    fn test_empty_file_is_empty_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, "").unwrap();
        assert_eq!(load(&path).unwrap().0, Config::default());
        fs::write(&path, "# just a comment\n").unwrap();
        assert_eq!(load(&path).unwrap().0, Config::default());
    }

    #[test]
    fn test_parse_error_has_position() {
        let err = parse("items:\n  - type: item\n   label: [unclosed\n").unwrap_err();
        match err {
            LoadError::Parse { line, .. } => assert!(line >= 2),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_root_not_mapping() {
        assert!(matches!(
            parse("- a\n- b\n"),
            Err(LoadError::NotAMapping { actual: "sequence" })
        ));
    }

    #[test]
    fn test_unchanged_save_is_byte_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, COMMENTED).unwrap();

        let (config, state) = load(&path).unwrap();
        let report = save(&path, &config, &state).unwrap();

        assert_eq!(report.format, SaveFormat::Verbatim);
        assert_eq!(fs::read_to_string(&path).unwrap(), COMMENTED);
        assert!(report.backup.is_some());
    }

    #[test]
    fn test_label_edit_preserves_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, COMMENTED).unwrap();

        let (mut config, state) = load(&path).unwrap();
        if let MenuNode::Item(item) = &mut config.items[0] {
            item.label = "Home".to_string();
        }
        let report = save(&path, &config, &state).unwrap();

        assert_eq!(report.format, SaveFormat::Patched);
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, COMMENTED.replace("label: Files      #", "label: Home      #"));
        assert_eq!(load(&path).unwrap().0, config);

        let backup = report.backup.unwrap();
        assert_eq!(fs::read_to_string(backup.copy).unwrap(), COMMENTED);
    }

    #[test]
    fn test_structural_edit_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, COMMENTED).unwrap();

        let (mut config, state) = load(&path).unwrap();
        config.items.insert(1, MenuNode::Separator);
        if let MenuNode::Group(group) = &mut config.items[2] {
            group.items.push(MenuNode::Item(Item::new("Disk", "ncdu /")));
        }
        save(&path, &config, &state).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("# Launcher menu"));
        assert!(written.contains("# file manager"));
        assert!(written.contains("# tools below"));
        assert_eq!(load(&path).unwrap().0, config);
    }

    #[test]
    fn test_flow_document_falls_back_to_canonical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, "{items: [{type: item, label: a, cmd: b}]}\n").unwrap();

        let (mut config, state) = load(&path).unwrap();
        config.items.push(MenuNode::Separator);
        let report = save(&path, &config, &state).unwrap();

        assert_eq!(report.format, SaveFormat::Canonical);
        assert_eq!(load(&path).unwrap().0, config);
    }

    #[test]
    fn test_new_file_has_no_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        let config = Config {
            items: vec![MenuNode::Group(Group::new(
                "G",
                vec![MenuNode::Item(Item::new("x", "y"))],
            ))],
        };
        let report = save(&path, &config, &FormatState::default()).unwrap();
        assert!(report.backup.is_none());
        assert!(report.fingerprint.is_some());
        assert_eq!(load(&path).unwrap().0, config);
    }

    #[test]
    fn test_invalid_tree_not_saved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        let config = Config {
            items: vec![MenuNode::Item(Item::new("", "true"))],
        };
        let err = save(&path, &config, &FormatState::default()).unwrap_err();
        assert!(matches!(err, SaveError::Invalid { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_blocked_backup_aborts_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, "items: []\n").unwrap();

        // Make the directory read-only so the backup copy cannot be created.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();
            let scratch = dir.path().join("scratch");
            if fs::write(&scratch, "").is_ok() {
                // Running as root: permissions are not enforced.
                let _ = fs::remove_file(&scratch);
                fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
                return;
            }

            let config = Config {
                items: vec![MenuNode::Separator],
            };
            let (_, state) = load(&path).unwrap();
            let err = save(&path, &config, &state).unwrap_err();
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();

            assert!(matches!(err, SaveError::Backup(_)));
            assert_eq!(fs::read_to_string(&path).unwrap(), "items: []\n");
        }
    }

    #[test]
    fn test_concurrent_reader_never_sees_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, COMMENTED).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let path = path.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let text = fs::read_to_string(&path).unwrap();
                    parse(&text).unwrap();
                }
            })
        };

        let (mut config, mut state) = load(&path).unwrap();
        for n in 0..30 {
            if let MenuNode::Item(item) = &mut config.items[0] {
                item.cmd = format!("nautilus --window {}", n);
            }
            state = save(&path, &config, &state).unwrap().state;
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[test]
    fn test_too_deep_rejected() {
        let mut node = MenuNode::Item(Item::new("leaf", "true"));
        for n in 0..MAX_RENDER_DEPTH + 1 {
            node = MenuNode::Group(Group::new(format!("g{}", n), vec![node]));
        }
        let config = Config { items: vec![node] };
        let dir = tempdir().unwrap();
        let err = save(&dir.path().join("c.yaml"), &config, &FormatState::default()).unwrap_err();
        assert!(matches!(err, SaveError::TooDeep { .. }));
    }
}
