//! Terminal emulator lookup and command wrapping.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Emulators tried in order when the settings do not say otherwise.
pub const DEFAULT_TERMINALS: &[&str] =
    &["x-terminal-emulator", "gnome-terminal", "xterm", "konsole"];

/// Finds executables by name.
pub trait TerminalResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<PathBuf>;
}

/// Looks names up in `$PATH` like a shell would.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathSearch;

impl TerminalResolver for PathSearch {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.contains('/') {
            let path = PathBuf::from(name);
            return is_executable(&path).then_some(path);
        }
        let search = env::var_os("PATH")?;
        env::split_paths(&search)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// A resolved emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub name: String,
    pub program: PathBuf,
}

impl Terminal {
    /// Arguments that make the emulator run `cmd` in a login shell. The
    /// command is passed as a single argument, never re-split.
    pub fn args(&self, cmd: &str) -> Vec<String> {
        let prefix: &[&str] = match self.name.as_str() {
            "gnome-terminal" => &["--", "bash", "-lc"],
            "xterm" | "konsole" => &["-e", "bash", "-lc"],
            _ => &["-e", "sh", "-lc"],
        };
        prefix
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(cmd.to_string()))
            .collect()
    }
}

/// First emulator of `candidates` that resolves.
pub fn find_terminal(resolver: &dyn TerminalResolver, candidates: &[String]) -> Option<Terminal> {
    candidates.iter().find_map(|name| {
        resolver.resolve(name).map(|program| Terminal {
            name: base_name(name).to_string(),
            program,
        })
    })
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixed(HashMap<&'static str, &'static str>);

    impl TerminalResolver for Fixed {
        fn resolve(&self, name: &str) -> Option<PathBuf> {
            self.0.get(name).map(PathBuf::from)
        }
    }

    fn defaults() -> Vec<String> {
        DEFAULT_TERMINALS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_available_wins() {
        let resolver = Fixed(HashMap::from([
            ("xterm", "/usr/bin/xterm"),
            ("konsole", "/usr/bin/konsole"),
        ]));
        let term = find_terminal(&resolver, &defaults()).unwrap();
        assert_eq!(term.name, "xterm");
        assert_eq!(term.program, PathBuf::from("/usr/bin/xterm"));
    }

    #[test]
    fn test_none_available() {
        let resolver = Fixed(HashMap::new());
        assert!(find_terminal(&resolver, &defaults()).is_none());
    }

    #[test]
    fn test_wrapping_per_emulator() {
        let term = |name: &str| Terminal {
            name: name.to_string(),
            program: PathBuf::from(name),
        };
        let cmd = "htop; read -p 'done' x";
        assert_eq!(
            term("x-terminal-emulator").args(cmd),
            vec!["-e", "sh", "-lc", cmd]
        );
        assert_eq!(term("gnome-terminal").args(cmd), vec!["--", "bash", "-lc", cmd]);
        assert_eq!(term("xterm").args(cmd), vec!["-e", "bash", "-lc", cmd]);
        assert_eq!(term("konsole").args(cmd), vec!["-e", "bash", "-lc", cmd]);
        assert_eq!(term("alacritty").args(cmd), vec!["-e", "sh", "-lc", cmd]);
    }

    #[test]
    fn test_path_search_finds_sh() {
        assert!(PathSearch.resolve("sh").is_some());
        assert!(PathSearch.resolve("definitely-not-a-terminal-xyz").is_none());
    }

    #[test]
    fn test_absolute_candidate_keeps_base_name() {
        let resolver = Fixed(HashMap::from([("/opt/bin/xterm", "/opt/bin/xterm")]));
        let term = find_terminal(&resolver, &["/opt/bin/xterm".to_string()]).unwrap();
        assert_eq!(term.name, "xterm");
    }
}
