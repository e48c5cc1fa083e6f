//! Query shape normalization for MongoDB
//!
//! Reduces a query document to a canonical string in which every literal value
//! is erased, so structurally identical queries can be grouped without leaking
//! the values they carried.
//!
//! Keys are classified at every map level:
//! - operator keys start with `$`,
//! - structural keys (`filter`, `query`, `documents`) wrap operator content,
//! - everything else is a data key.
//!
//! Values under operator and structural keys are flattened with every data
//! entry retained. Values under data keys only keep entries that are still
//! lists or maps after flattening. The result is rendered with sorted keys and
//! the placeholder `1` standing in for every erased literal.

use crate::protocols::document::Document;
use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// Legacy OP_QUERY framing around the actual query document
const NESTED_QUERY_KEY: &str = "$query";

/// Prefix of query operator keys
const OPERATOR_SIGIL: char = '$';

/// Container fields whose contents are treated as operator content
const STRUCTURAL_KEYS: [&str; 3] = ["filter", "query", "documents"];

/// Normalized query structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// Placeholder for an erased value
    Unit,
    /// List of retained aggregate elements
    List(Vec<Shape>),
    /// Retained entries, kept in byte order of their keys
    Map(BTreeMap<String, Shape>),
}

impl Shape {
    /// Whether this shape is a list or a map
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Shape::List(_) | Shape::Map(_))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Unit => f.write_char('1'),
            Shape::List(items) => {
                f.write_char('[')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_char(']')
            }
            Shape::Map(entries) => {
                f.write_char('{')?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write_key(f, key)?;
                    write!(f, ":{}", value)?;
                }
                f.write_char('}')
            }
        }
    }
}

fn write_key(f: &mut fmt::Formatter<'_>, key: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in key.chars() {
        if c == '"' || c == '\\' {
            f.write_char('\\')?;
        }
        f.write_char(c)?;
    }
    f.write_char('"')
}

/// Whether a key routes its value through operator flattening
pub fn is_operator_key(key: &str) -> bool {
    key.starts_with(OPERATOR_SIGIL) || STRUCTURAL_KEYS.contains(&key)
}

/// Compute the canonical shape string of a query document
pub fn query_shape(document: &Document) -> String {
    normalize(document).to_string()
}

/// Normalize a query document into its shape tree
///
/// Top-level entries are always retained; only nested data entries are
/// pruned when they flatten to a placeholder.
pub fn normalize(document: &Document) -> Shape {
    match document {
        Document::Map(entries) => {
            if let Some(inner @ Document::Map(_)) = entries.get(NESTED_QUERY_KEY) {
                return normalize(inner);
            }

            let pruned: BTreeMap<String, Shape> = entries
                .iter()
                .map(|(key, value)| {
                    let shape: Shape = if is_operator_key(key) {
                        flatten_op(value)
                    } else {
                        flatten(value)
                    };
                    (key.clone(), shape)
                })
                .collect();

            Shape::Map(pruned)
        }
        other => flatten(other),
    }
}

fn flatten(value: &Document) -> Shape {
    match value {
        Document::List(items) => flatten_list(items, false),
        Document::Map(entries) => flatten_map(entries, false),
        Document::Scalar(_) | Document::Opaque(_) => Shape::Unit,
    }
}

fn flatten_op(value: &Document) -> Shape {
    match value {
        Document::List(items) => flatten_list(items, true),
        Document::Map(entries) => flatten_map(entries, true),
        Document::Scalar(_) | Document::Opaque(_) => Shape::Unit,
    }
}

fn flatten_map(entries: &BTreeMap<String, Document>, force_retain: bool) -> Shape {
    let mut kept: BTreeMap<String, Shape> = BTreeMap::new();

    for (key, value) in entries {
        if is_operator_key(key) {
            kept.insert(key.clone(), flatten_op(value));
        } else {
            let flattened: Shape = flatten(value);
            if force_retain || flattened.is_aggregate() {
                kept.insert(key.clone(), flattened);
            }
        }
    }

    if kept.is_empty() {
        Shape::Unit
    } else {
        Shape::Map(kept)
    }
}

fn flatten_list(items: &[Document], force_retain: bool) -> Shape {
    let mut kept: Vec<Shape> = Vec::new();

    for item in items {
        let flattened: Shape = match item {
            // Nested lists are structural, never operator-scoped
            Document::List(inner) => flatten_list(inner, false),
            Document::Map(entries) => flatten_map(entries, force_retain),
            Document::Scalar(_) | Document::Opaque(_) => continue,
        };
        if flattened.is_aggregate() {
            kept.push(flattened);
        }
    }

    if kept.is_empty() {
        Shape::Unit
    } else {
        Shape::List(kept)
    }
}
