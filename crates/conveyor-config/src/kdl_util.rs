//! Helpers for extracting values from KDL nodes.

use kdl::{KdlDocument, KdlNode};
use std::time::Duration;

use crate::{ConfigError, ConfigResult, parse_duration};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

pub(crate) fn first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

/// Repeated `name="..."` properties, or a `name "a" "b"` child node.
pub(crate) fn string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if result.is_empty() {
        if let Some(child) = child_node(node, name) {
            result = string_args(child);
        }
    }
    result
}

pub(crate) fn child_node<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|c| c.name().value() == name)
}

pub(crate) fn child_nodes(node: &KdlNode) -> &[KdlNode] {
    node.children().map(KdlDocument::nodes).unwrap_or(&[])
}

pub(crate) fn child_string(node: &KdlNode, name: &str) -> Option<String> {
    child_node(node, name).and_then(first_string_arg)
}

/// A duration given as a `timeout="30m"` property.
pub(crate) fn duration_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    string_prop(node, name)
        .map(|s| parse_duration(&s))
        .transpose()
}

/// A duration given as the first argument of a child node.
pub(crate) fn duration_child(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    match child_node(node, name) {
        Some(child) => {
            if let Some(secs) = first_int_arg(child) {
                let secs = u64::try_from(secs).map_err(|_| ConfigError::InvalidValue {
                    field: name.to_string(),
                    message: "duration must not be negative".to_string(),
                })?;
                return Ok(Some(Duration::from_secs(secs)));
            }
            first_string_arg(child)
                .map(|s| parse_duration(&s))
                .transpose()
        }
        None => Ok(None),
    }
}

/// `key "value"` children of a block such as `env { ... }`.
pub(crate) fn string_pairs(node: &KdlNode) -> Vec<(String, String)> {
    child_nodes(node)
        .iter()
        .filter_map(|child| {
            first_string_arg(child).map(|value| (child.name().value().to_string(), value))
        })
        .collect()
}
