//! Advisory diagnostics for a valid tree.
//!
//! Lints never block a load or a save. They flag things that are legal but
//! probably not what the author meant.

use super::{Config, MenuNode, NodePath, PathSegment};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Command fragments worth a second look before they end up behind a click.
pub const DANGEROUS_FRAGMENTS: &[&str] = &["rm -rf", "sudo rm", "dd if=", "mkfs", "fdisk"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lint {
    #[serde(serialize_with = "serialize_path")]
    pub path: NodePath,
    #[serde(flatten)]
    pub kind: LintKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "lint", rename_all = "snake_case")]
pub enum LintKind {
    EmptyConfig,
    EmptyGroup,
    DuplicateLabel { label: String },
    LeadingSeparator,
    TrailingSeparator,
    AdjacentSeparators,
    DangerousCommand { fragment: &'static str },
    PipeFragment,
}

fn serialize_path<S: serde::Serializer>(path: &NodePath, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(path)
}

impl fmt::Display for Lint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.path)?;
        match &self.kind {
            LintKind::EmptyConfig => f.write_str("configuration has no items"),
            LintKind::EmptyGroup => f.write_str("group has no items"),
            LintKind::DuplicateLabel { label } => write!(f, "duplicate label '{}'", label),
            LintKind::LeadingSeparator => f.write_str("separator at the start has no effect"),
            LintKind::TrailingSeparator => f.write_str("separator at the end has no effect"),
            LintKind::AdjacentSeparators => f.write_str("back-to-back separators"),
            LintKind::DangerousCommand { fragment } => {
                write!(f, "command contains '{}'", fragment)
            }
            LintKind::PipeFragment => f.write_str("command looks like a pipe fragment"),
        }
    }
}

/// Collect all lints for `config`, in document order.
pub fn lint(config: &Config) -> Vec<Lint> {
    let mut lints = Vec::new();
    if config.items.is_empty() {
        lints.push(Lint {
            path: NodePath::root(),
            kind: LintKind::EmptyConfig,
        });
        return lints;
    }
    let mut path = NodePath::root();
    path.push(PathSegment::Key("items".to_string()));
    lint_level(&config.items, &mut path, 0, &mut lints);
    lints
}

fn lint_level(nodes: &[MenuNode], path: &mut NodePath, depth: usize, lints: &mut Vec<Lint>) {
    if depth >= super::MAX_RENDER_DEPTH {
        return;
    }
    let mut seen = HashSet::new();
    let last = nodes.len().saturating_sub(1);

    for (idx, node) in nodes.iter().enumerate() {
        path.push(PathSegment::Index(idx));
        let mut report = |kind| {
            lints.push(Lint {
                path: path.clone(),
                kind,
            })
        };

        if let Some(label) = node.label() {
            if !seen.insert(label) {
                report(LintKind::DuplicateLabel {
                    label: label.to_string(),
                });
            }
        }

        match node {
            MenuNode::Separator => {
                if idx == 0 {
                    report(LintKind::LeadingSeparator);
                }
                if idx == last {
                    report(LintKind::TrailingSeparator);
                }
                if matches!(nodes.get(idx + 1), Some(MenuNode::Separator)) {
                    report(LintKind::AdjacentSeparators);
                }
            }
            MenuNode::Item(item) => {
                for kind in command_lints(&item.cmd) {
                    report(kind);
                }
            }
            MenuNode::Group(group) => {
                if group.items.is_empty() {
                    report(LintKind::EmptyGroup);
                } else {
                    path.push(PathSegment::Key("items".to_string()));
                    lint_level(&group.items, path, depth + 1, lints);
                    path.pop();
                }
            }
        }
        path.pop();
    }
}

fn command_lints(cmd: &str) -> Vec<LintKind> {
    let trimmed = cmd.trim();
    let mut found = Vec::new();
    if trimmed.starts_with('|') || trimmed.ends_with('|') {
        found.push(LintKind::PipeFragment);
    }
    let lower = trimmed.to_lowercase();
    for &fragment in DANGEROUS_FRAGMENTS {
        if lower.contains(fragment) {
            found.push(LintKind::DangerousCommand { fragment });
        }
    }
    found
}
