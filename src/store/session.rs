use super::{load, save, FormatState, LoadError, SaveError, SaveReport};
use crate::menu::Config;
use std::path::{Path, PathBuf};
use tracing::debug;

/// An editor's handle on one configuration file.
///
/// Keeps the tree and its format state together so every edit is saved
/// against the text it was loaded from.
#[derive(Debug)]
pub struct ConfigSession {
    path: PathBuf,
    config: Config,
    state: FormatState,
}

impl ConfigSession {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let path = path.into();
        let (config, state) = load(&path)?;
        Ok(Self {
            path,
            config,
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply `edit` to a copy of the tree and save it.
    ///
    /// The session only advances when the save succeeds; on error the
    /// in-memory tree is still the last saved one.
    pub fn update<F>(&mut self, edit: F) -> Result<SaveReport, SaveError>
    where
        F: FnOnce(&mut Config),
    {
        let mut next = self.config.clone();
        edit(&mut next);
        let report = save(&self.path, &next, &self.state)?;
        self.config = next;
        self.state = report.state.clone();
        Ok(report)
    }

    /// Re-read the file, dropping the in-memory tree.
    pub fn reload(&mut self) -> Result<&Config, LoadError> {
        let (config, state) = load(&self.path)?;
        debug!("Session reloaded {}", self.path.display());
        self.config = config;
        self.state = state;
        Ok(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::{Item, MenuNode};
    use crate::store::SaveFormat;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_successive_edits_keep_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(
            &path,
            "# header\nitems:\n  - type: item  # first\n    label: A\n    cmd: a\n",
        )
        .unwrap();

        let mut session = ConfigSession::open(&path).unwrap();
        let first = session
            .update(|c| c.items.push(MenuNode::Item(Item::new("B", "b"))))
            .unwrap();
        assert_eq!(first.format, SaveFormat::Patched);

        let second = session
            .update(|c| {
                if let MenuNode::Item(item) = &mut c.items[1] {
                    item.cmd = "bb".to_string();
                }
            })
            .unwrap();
        assert_eq!(second.format, SaveFormat::Patched);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# header\nitems:\n  - type: item  # first\n"));
        assert!(text.contains("cmd: bb"));
        assert_eq!(session.config().items.len(), 2);
    }

    #[test]
    fn test_rapid_updates_all_saved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        fs::write(&path, "items: []\n").unwrap();

        let mut session = ConfigSession::open(&path).unwrap();
        for n in 0..20 {
            let item = Item::new(format!("item {}", n), "true");
            session.update(|c| c.items.push(MenuNode::Item(item))).unwrap();
        }

        assert_eq!(session.config().items.len(), 20);
        assert_eq!(crate::backup::list(&path).unwrap().len(), 20);
    }

    #[test]
    fn test_failed_update_leaves_session_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        let mut session = ConfigSession::open(&path).unwrap();

        let err = session
            .update(|c| c.items.push(MenuNode::Item(Item::new("", "x"))))
            .unwrap_err();
        assert!(matches!(err, SaveError::Invalid { .. }));
        assert!(session.config().items.is_empty());
    }

    #[test]
    fn test_reload_picks_up_external_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.yaml");
        let mut session = ConfigSession::open(&path).unwrap();

        fs::write(&path, "items: [{type: separator}]\n").unwrap();
        assert_eq!(session.reload().unwrap().items, vec![MenuNode::Separator]);
    }
}
