//! Menu tree model.
//!
//! A configuration is an ordered list of [`MenuNode`]s. Groups nest further
//! nodes, so the whole thing forms a tree whose sibling order is the order
//! the entries appear in the YAML file.
//!
//! The types here are the *validated* view of a document. They are built by
//! [`validate`] from an untyped [`serde_yaml::Value`] and are never mutated
//! in place once published; edits go through [`crate::store::ConfigSession`].

use std::collections::BTreeMap;
use std::fmt;

pub mod lint;
mod validate;

pub use validate::{validate, ErrorKind, SchemaError, ValidationError};

/// Nesting ceiling for recursive walkers that produce output (debug
/// printing, renderers). The schema itself allows any depth.
pub const MAX_RENDER_DEPTH: usize = 64;

/// Root of a menu configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub items: Vec<MenuNode>,
}

/// One entry of a menu level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuNode {
    Item(Item),
    Separator,
    Group(Group),
}

/// A runnable leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub label: String,
    pub cmd: String,
    /// Run inside a terminal emulator instead of a plain shell.
    pub terminal: bool,
    /// Ask before running.
    pub confirm: bool,
    /// Variables overlaid on the inherited environment.
    pub env: BTreeMap<String, String>,
}

/// A submenu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub label: String,
    pub items: Vec<MenuNode>,
}

/// The `type` discriminator as it appears in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Item,
    Separator,
    Group,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Item => "item",
            NodeKind::Separator => "separator",
            NodeKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "item" => Some(NodeKind::Item),
            "separator" => Some(NodeKind::Separator),
            "group" => Some(NodeKind::Group),
            _ => None,
        }
    }
}

impl Item {
    /// Item with default flags and no environment.
    pub fn new(label: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            cmd: cmd.into(),
            terminal: false,
            confirm: false,
            env: BTreeMap::new(),
        }
    }
}

impl Group {
    pub fn new(label: impl Into<String>, items: Vec<MenuNode>) -> Self {
        Self {
            label: label.into(),
            items,
        }
    }
}

impl MenuNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            MenuNode::Item(_) => NodeKind::Item,
            MenuNode::Separator => NodeKind::Separator,
            MenuNode::Group(_) => NodeKind::Group,
        }
    }

    /// Display label, if the node has one.
    pub fn label(&self) -> Option<&str> {
        match self {
            MenuNode::Item(item) => Some(&item.label),
            MenuNode::Group(group) => Some(&group.label),
            MenuNode::Separator => None,
        }
    }
}

impl Config {
    /// Look up a node by its index path (`[2, 0]` is the first child of the
    /// third top-level node).
    pub fn node_at(&self, indices: &[usize]) -> Option<&MenuNode> {
        let (first, rest) = indices.split_first()?;
        let mut node = self.items.get(*first)?;
        for idx in rest {
            match node {
                MenuNode::Group(group) => node = group.items.get(*idx)?,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Look up an item by index path. Separators and groups yield `None`.
    pub fn item_at(&self, indices: &[usize]) -> Option<&Item> {
        match self.node_at(indices)? {
            MenuNode::Item(item) => Some(item),
            _ => None,
        }
    }

    /// Number of runnable items anywhere in the tree.
    pub fn item_count(&self) -> usize {
        fn count(nodes: &[MenuNode]) -> usize {
            nodes
                .iter()
                .map(|n| match n {
                    MenuNode::Item(_) => 1,
                    MenuNode::Separator => 0,
                    MenuNode::Group(g) => count(&g.items),
                })
                .sum()
        }
        count(&self.items)
    }

    /// Re-check the value constraints on a typed tree.
    ///
    /// Used before saving a tree that an editor modified: the types already
    /// guarantee the shape, but labels and commands may have been emptied.
    pub fn check(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut path = NodePath::root().child_key("items");
        check_nodes(&self.items, &mut path, &mut errors);
        errors
    }
}

fn check_nodes(nodes: &[MenuNode], path: &mut NodePath, errors: &mut Vec<ValidationError>) {
    for (idx, node) in nodes.iter().enumerate() {
        path.push(PathSegment::Index(idx));
        match node {
            MenuNode::Item(item) => {
                if item.label.trim().is_empty() {
                    errors.push(ValidationError::new(
                        path.clone(),
                        ErrorKind::EmptyRequiredValue { field: "label" },
                    ));
                }
                if item.cmd.trim().is_empty() {
                    errors.push(ValidationError::new(
                        path.clone(),
                        ErrorKind::EmptyRequiredValue { field: "cmd" },
                    ));
                }
            }
            MenuNode::Separator => {}
            MenuNode::Group(group) => {
                if group.label.trim().is_empty() {
                    errors.push(ValidationError::new(
                        path.clone(),
                        ErrorKind::EmptyRequiredValue { field: "label" },
                    ));
                }
                path.push(PathSegment::Key("items".to_string()));
                check_nodes(&group.items, path, errors);
                path.pop();
            }
        }
        path.pop();
    }
}

/// One step of a [`NodePath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Structural location inside the document, e.g. `items[2].items[1]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodePath(Vec<PathSegment>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Only the sequence indices, i.e. the form [`Config::node_at`] takes.
    pub fn indices(&self) -> Vec<usize> {
        self.0
            .iter()
            .filter_map(|s| match s {
                PathSegment::Index(i) => Some(*i),
                PathSegment::Key(_) => None,
            })
            .collect()
    }

    pub fn child_key(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.push(PathSegment::Key(key.to_string()));
        next
    }

    pub fn child_index(&self, idx: usize) -> Self {
        let mut next = self.clone();
        next.push(PathSegment::Index(idx));
        next
    }

    pub(crate) fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub(crate) fn pop(&mut self) {
        self.0.pop();
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{}", key)?,
                PathSegment::Key(key) => write!(f, ".{}", key)?,
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

/// Write the tree as an indented outline, one node per line.
pub fn write_outline(config: &Config, out: &mut impl fmt::Write) -> fmt::Result {
    fn walk(nodes: &[MenuNode], depth: usize, out: &mut impl fmt::Write) -> fmt::Result {
        let pad = "  ".repeat(depth);
        if depth >= MAX_RENDER_DEPTH {
            return writeln!(out, "{}…", pad);
        }
        for node in nodes {
            match node {
                MenuNode::Item(item) => {
                    let mut flags = Vec::new();
                    if item.terminal {
                        flags.push("terminal");
                    }
                    if item.confirm {
                        flags.push("confirm");
                    }
                    let flags = if flags.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", flags.join(", "))
                    };
                    writeln!(out, "{}{} -> {}{}", pad, item.label, item.cmd, flags)?;
                }
                MenuNode::Separator => writeln!(out, "{}---", pad)?,
                MenuNode::Group(group) => {
                    writeln!(out, "{}{}/", pad, group.label)?;
                    walk(&group.items, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }
    walk(&config.items, 0, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            items: vec![
                MenuNode::Item(Item::new("Terminal", "xterm")),
                MenuNode::Separator,
                MenuNode::Group(Group::new(
                    "Dev",
                    vec![
                        MenuNode::Item(Item::new("Build", "make")),
                        MenuNode::Group(Group::new(
                            "Deep",
                            vec![MenuNode::Item(Item::new("Test", "make test"))],
                        )),
                    ],
                )),
            ],
        }
    }

    #[test]
    fn test_node_at() {
        let config = sample();
        assert_eq!(config.node_at(&[1]), Some(&MenuNode::Separator));
        assert_eq!(config.item_at(&[2, 0]).map(|i| i.cmd.as_str()), Some("make"));
        assert_eq!(
            config.item_at(&[2, 1, 0]).map(|i| i.label.as_str()),
            Some("Test")
        );
        assert!(config.node_at(&[0, 0]).is_none());
        assert!(config.node_at(&[]).is_none());
        assert!(config.item_at(&[2]).is_none());
    }

    #[test]
    fn test_item_count() {
        assert_eq!(sample().item_count(), 3);
        assert_eq!(Config::default().item_count(), 0);
    }

    #[test]
    fn test_path_display() {
        let path = NodePath::root()
            .child_key("items")
            .child_index(2)
            .child_key("items")
            .child_index(1);
        assert_eq!(path.to_string(), "items[2].items[1]");
        assert_eq!(path.indices(), vec![2, 1]);
        assert_eq!(NodePath::root().to_string(), "<root>");
        assert_eq!(path.child_key("env").to_string(), "items[2].items[1].env");
    }

    #[test]
    fn test_check_reports_emptied_values() {
        let mut config = sample();
        if let MenuNode::Group(group) = &mut config.items[2] {
            if let MenuNode::Item(item) = &mut group.items[0] {
                item.cmd = "   ".to_string();
            }
        }
        let errors = config.check();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path.to_string(), "items[2].items[0]");
        assert_eq!(errors[0].kind, ErrorKind::EmptyRequiredValue { field: "cmd" });
    }

    #[test]
    fn test_outline() {
        let mut out = String::new();
        write_outline(&sample(), &mut out).unwrap();
        assert_eq!(
            out,
            "Terminal -> xterm\n---\nDev/\n  Build -> make\n  Deep/\n    Test -> make test\n"
        );
    }
}
