//! Schema validation of an untyped YAML document.
//!
//! The validator walks the document once, collects every problem it finds
//! with the path of the offending node, and only builds a [`Config`] when
//! the document is clean. Nothing is partially accepted.

use super::{Config, Group, Item, MenuNode, NodeKind, NodePath};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Outcome of a failed [`validate`] call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The document is not even a mapping; nothing can be validated.
    #[error("configuration root must be a mapping, found {actual}")]
    NotAMapping { actual: &'static str },

    #[error("{} validation error(s), first: {}", .0.len(), first_message(.0))]
    Invalid(Vec<ValidationError>),
}

fn first_message(errors: &[ValidationError]) -> String {
    errors.first().map(ToString::to_string).unwrap_or_default()
}

/// A single schema violation, addressed by its position in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    #[serde(serialize_with = "serialize_path")]
    pub path: NodePath,
    #[serde(flatten)]
    pub kind: ErrorKind,
}

/// What went wrong at [`ValidationError::path`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// `type` is not one of `item`, `separator`, `group`.
    UnknownNodeType { found: String },
    MissingField { field: &'static str },
    TypeMismatch {
        /// `None` when the node itself has the wrong shape.
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        expected: &'static str,
        actual: &'static str,
    },
    EmptyRequiredValue { field: &'static str },
}

fn serialize_path<S: serde::Serializer>(path: &NodePath, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(path)
}

impl ValidationError {
    pub(crate) fn new(path: NodePath, kind: ErrorKind) -> Self {
        Self { path, kind }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::UnknownNodeType { found } => {
                write!(f, "{}: unknown node type '{}'", self.path, found)
            }
            ErrorKind::MissingField { field } => {
                write!(f, "{}: missing required field '{}'", self.path, field)
            }
            ErrorKind::TypeMismatch {
                field: Some(field),
                expected,
                actual,
            } => write!(
                f,
                "{}: field '{}' must be a {}, found {}",
                self.path, field, expected, actual
            ),
            ErrorKind::TypeMismatch {
                field: None,
                expected,
                actual,
            } => write!(f, "{}: expected a {}, found {}", self.path, expected, actual),
            ErrorKind::EmptyRequiredValue { field } => {
                write!(f, "{}: field '{}' must not be empty", self.path, field)
            }
        }
    }
}

/// Validate a deserialized document and build the menu tree.
///
/// A null document (empty file) is the empty configuration. A missing
/// `items` key, at the root or on a group, means an empty list.
pub fn validate(document: &Value) -> Result<Config, SchemaError> {
    let root = match document {
        Value::Null => return Ok(Config::default()),
        Value::Mapping(map) => map,
        other => {
            return Err(SchemaError::NotAMapping {
                actual: type_name(other),
            })
        }
    };

    let mut validator = Validator::default();
    let items = validator.children(root, &NodePath::root());

    if validator.errors.is_empty() {
        Ok(Config { items })
    } else {
        Err(SchemaError::Invalid(validator.errors))
    }
}

/// Short type name used in mismatch messages.
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

#[derive(Default)]
struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    fn report(&mut self, path: &NodePath, kind: ErrorKind) {
        self.errors.push(ValidationError::new(path.clone(), kind));
    }

    /// Validate the `items` list of a mapping (root or group).
    fn children(&mut self, map: &Mapping, path: &NodePath) -> Vec<MenuNode> {
        match map.get("items") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(seq)) => {
                let items_path = path.child_key("items");
                seq.iter()
                    .enumerate()
                    .filter_map(|(idx, value)| self.node(value, &items_path.child_index(idx)))
                    .collect()
            }
            Some(other) => {
                self.report(
                    path,
                    ErrorKind::TypeMismatch {
                        field: Some("items".to_string()),
                        expected: "sequence",
                        actual: type_name(other),
                    },
                );
                Vec::new()
            }
        }
    }

    fn node(&mut self, value: &Value, path: &NodePath) -> Option<MenuNode> {
        let Value::Mapping(map) = value else {
            self.report(
                path,
                ErrorKind::TypeMismatch {
                    field: None,
                    expected: "mapping",
                    actual: type_name(value),
                },
            );
            return None;
        };

        let kind = match map.get("type") {
            None => {
                self.report(path, ErrorKind::MissingField { field: "type" });
                return None;
            }
            Some(Value::String(s)) => match NodeKind::parse(s) {
                Some(kind) => kind,
                None => {
                    self.report(path, ErrorKind::UnknownNodeType { found: s.clone() });
                    return None;
                }
            },
            Some(other) => {
                self.report(
                    path,
                    ErrorKind::TypeMismatch {
                        field: Some("type".to_string()),
                        expected: "string",
                        actual: type_name(other),
                    },
                );
                return None;
            }
        };

        Some(match kind {
            NodeKind::Separator => MenuNode::Separator,
            NodeKind::Item => MenuNode::Item(Item {
                label: self.required_string(map, "label", path),
                cmd: self.required_string(map, "cmd", path),
                terminal: self.optional_bool(map, "terminal", path),
                confirm: self.optional_bool(map, "confirm", path),
                env: self.env(map, path),
            }),
            NodeKind::Group => MenuNode::Group(Group {
                label: self.required_string(map, "label", path),
                items: self.children(map, path),
            }),
        })
    }

    fn required_string(&mut self, map: &Mapping, field: &'static str, path: &NodePath) -> String {
        match map.get(field) {
            None => {
                self.report(path, ErrorKind::MissingField { field });
                String::new()
            }
            Some(Value::Null) => {
                self.report(path, ErrorKind::EmptyRequiredValue { field });
                String::new()
            }
            Some(Value::String(s)) => {
                if s.trim().is_empty() {
                    self.report(path, ErrorKind::EmptyRequiredValue { field });
                }
                s.clone()
            }
            Some(other) => {
                self.report(
                    path,
                    ErrorKind::TypeMismatch {
                        field: Some(field.to_string()),
                        expected: "string",
                        actual: type_name(other),
                    },
                );
                String::new()
            }
        }
    }

    fn optional_bool(&mut self, map: &Mapping, field: &'static str, path: &NodePath) -> bool {
        match map.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                self.report(
                    path,
                    ErrorKind::TypeMismatch {
                        field: Some(field.to_string()),
                        expected: "bool",
                        actual: type_name(other),
                    },
                );
                false
            }
        }
    }

    fn env(&mut self, map: &Mapping, path: &NodePath) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let entries = match map.get("env") {
            None | Some(Value::Null) => return env,
            Some(Value::Mapping(entries)) => entries,
            Some(other) => {
                self.report(
                    path,
                    ErrorKind::TypeMismatch {
                        field: Some("env".to_string()),
                        expected: "mapping of string to string",
                        actual: type_name(other),
                    },
                );
                return env;
            }
        };

        for (key, value) in entries {
            let Value::String(key) = key else {
                self.report(
                    path,
                    ErrorKind::TypeMismatch {
                        field: Some("env".to_string()),
                        expected: "mapping of string to string",
                        actual: type_name(key),
                    },
                );
                continue;
            };
            if key.trim().is_empty() {
                self.report(path, ErrorKind::EmptyRequiredValue { field: "env" });
                continue;
            }
            match value {
                Value::String(v) => {
                    env.insert(key.clone(), v.clone());
                }
                other => self.report(
                    path,
                    ErrorKind::TypeMismatch {
                        field: Some(format!("env.{}", key)),
                        expected: "string",
                        actual: type_name(other),
                    },
                ),
            }
        }
        env
    }
}
