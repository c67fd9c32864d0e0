//! Active-path reconstruction over the conversation DAG.
//!
//! [`traverse`] starts at the active leaf and follows `parent` links back to
//! the root. Superseded edit and regeneration branches are never visited, so
//! no weight interpretation is needed along the way. [`forward_traverse`]
//! walks root-to-leaf choosing the heaviest child at every fork; it exists as
//! a reference walk and agrees with [`traverse`] whenever nothing branches.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use crate::raw::{Mapping, RawMessage, RawNode};

/// A message on the active path, tagged with its position in that path.
#[derive(Debug, Clone, Copy)]
pub struct TraversedMessage<'a> {
    pub graph_index: usize,
    pub node_id: &'a str,
    pub message: &'a RawMessage,
}

/// `1.0` for a missing message or a null weight, the literal weight otherwise.
pub fn effective_weight(message: Option<&RawMessage>) -> f64 {
    message.and_then(|m| m.weight).unwrap_or(1.0)
}

fn recency(node: &RawNode) -> f64 {
    node.message
        .as_ref()
        .and_then(|m| m.update_time.or(m.create_time))
        .unwrap_or(f64::NEG_INFINITY)
}

/// Orders nodes by `(effective weight, recency)`; ties go to the smaller id.
fn rank(a: (&str, &RawNode), b: (&str, &RawNode)) -> Ordering {
    effective_weight(a.1.message.as_ref())
        .total_cmp(&effective_weight(b.1.message.as_ref()))
        .then_with(|| recency(a.1).total_cmp(&recency(b.1)))
        .then_with(|| b.0.cmp(a.0))
}

/// Best leaf when `current_node` cannot be used. Only leaves that carry a
/// message are candidates.
pub fn select_leaf(mapping: &Mapping) -> Option<&str> {
    mapping
        .iter()
        .filter(|(_, node)| node.children.is_empty() && node.message.is_some())
        .map(|(id, node)| (id.as_str(), node))
        .max_by(|a, b| rank(*a, *b))
        .map(|(id, _)| id)
}

/// `current_node` when it names a node in the mapping, else the best leaf.
pub fn resolve_start<'a>(mapping: &'a Mapping, current_node: Option<&str>) -> Option<&'a str> {
    if let Some(id) = current_node {
        if let Some((key, _)) = mapping.get_key_value(id) {
            return Some(key.as_str());
        }
        debug!(current_node = id, "current_node not in mapping, falling back to leaf selection");
    }
    select_leaf(mapping)
}

/// Ordered messages of the active path, root first.
///
/// Never fails: an empty mapping, no leaf, or a start node whose ancestry is
/// all empty yields an empty list. A node seen twice ends the walk.
pub fn traverse<'a>(mapping: &'a Mapping, current_node: Option<&str>) -> Vec<TraversedMessage<'a>> {
    let Some(start) = resolve_start(mapping, current_node) else {
        return Vec::new();
    };

    let mut visited: HashSet<&str> = HashSet::new();
    let mut path: Vec<(&str, &RawMessage)> = Vec::new();
    let mut cursor = Some(start);

    while let Some(id) = cursor {
        if !visited.insert(id) {
            debug!(node = id, "cycle in parent links, stopping traversal");
            break;
        }
        let Some((key, node)) = mapping.get_key_value(id) else {
            break;
        };
        if let Some(message) = &node.message {
            path.push((key.as_str(), message));
        }
        cursor = node.parent.as_deref();
    }

    path.reverse();
    index(path)
}

/// Root-to-leaf walk taking the highest-ranked child at each fork.
pub fn forward_traverse(mapping: &Mapping) -> Vec<TraversedMessage<'_>> {
    let root = mapping
        .iter()
        .filter(|(_, node)| {
            node.parent
                .as_deref()
                .map_or(true, |parent| !mapping.contains_key(parent))
        })
        .map(|(id, _)| id.as_str())
        .min();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut path = Vec::new();
    let mut cursor = root;

    while let Some(id) = cursor {
        if !visited.insert(id) {
            break;
        }
        let Some((key, node)) = mapping.get_key_value(id) else {
            break;
        };
        if let Some(message) = &node.message {
            path.push((key.as_str(), message));
        }
        cursor = node
            .children
            .iter()
            .filter_map(|child| mapping.get_key_value(child.as_str()))
            .map(|(child_id, child)| (child_id.as_str(), child))
            .max_by(|a, b| rank(*a, *b))
            .map(|(child_id, _)| child_id);
    }

    index(path)
}

fn index<'a>(path: Vec<(&'a str, &'a RawMessage)>) -> Vec<TraversedMessage<'a>> {
    path.into_iter()
        .enumerate()
        .map(|(graph_index, (node_id, message))| TraversedMessage {
            graph_index,
            node_id,
            message,
        })
        .collect()
}
