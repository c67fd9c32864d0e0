//! Per-conversation failure records.
//!
//! A failure is data, not an abort: the pipeline returns it in the `Err` arm
//! for one conversation and the batch moves on. Structural statistics are
//! gathered from the undecoded JSON so they are available even when the
//! record could not be decoded at all.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::conversation::truncate_chars;

pub const TITLE_LIMIT: usize = 50;
pub const MESSAGE_LIMIT: usize = 500;
const NODE_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// No usable start node, or the active path held no messages.
    Structural,
    /// `mapping` absent or null.
    MissingMapping,
    /// The record's shape does not fit the export model.
    Decode,
    /// An extraction step panicked.
    Internal,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureCategory::Structural => "structural",
            FailureCategory::MissingMapping => "missing_mapping",
            FailureCategory::Decode => "decode",
            FailureCategory::Internal => "internal",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{category} failure in conversation {conversation_id} ({title}): {message}")]
pub struct ExtractionFailure {
    pub conversation_id: String,
    pub title: String,
    pub category: FailureCategory,
    pub message: String,
    pub structural_issues: Vec<String>,
    pub stats: StructuralStats,
}

impl ExtractionFailure {
    pub fn new(
        record: &Value,
        conversation_id: &str,
        title: &str,
        category: FailureCategory,
        message: impl fmt::Display,
    ) -> Self {
        let stats = StructuralStats::collect(record);
        Self {
            conversation_id: conversation_id.to_owned(),
            title: truncate_chars(title, TITLE_LIMIT),
            category,
            message: truncate_chars(&message.to_string(), MESSAGE_LIMIT),
            structural_issues: stats.issues(),
            stats,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProblemNode {
    pub node_id: String,
    pub role: Option<String>,
    pub content_type: Option<String>,
    pub issue: &'static str,
}

/// Shape summary of a conversation record, for diagnosing failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructuralStats {
    pub message_count: usize,
    pub leaf_count: usize,
    pub null_content: usize,
    pub null_parts: usize,
    pub empty_parts: usize,
    pub has_mapping: bool,
    pub has_current_node: bool,
    pub current_node_valid: bool,
    pub project_id: Option<String>,
    pub problematic_nodes: Vec<ProblemNode>,
}

impl StructuralStats {
    pub fn collect(record: &Value) -> Self {
        let mapping = record.get("mapping").and_then(Value::as_object);
        let current = record.get("current_node").and_then(Value::as_str);

        let mut stats = StructuralStats {
            has_mapping: mapping.is_some_and(|m| !m.is_empty()),
            has_current_node: current.is_some_and(|c| !c.is_empty()),
            current_node_valid: match (current, mapping) {
                (Some(id), Some(m)) => m.contains_key(id),
                _ => false,
            },
            project_id: record
                .get("conversation_template_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            ..Default::default()
        };

        let Some(mapping) = mapping else {
            return stats;
        };
        for (node_id, node) in mapping {
            let childless = node
                .get("children")
                .and_then(Value::as_array)
                .map_or(true, Vec::is_empty);
            if childless {
                stats.leaf_count += 1;
            }
            let Some(message) = node.get("message").filter(|m| !m.is_null()) else {
                continue;
            };
            stats.message_count += 1;

            let role = message
                .pointer("/author/role")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let content = message.get("content").filter(|c| !c.is_null());
            let content_type = content
                .and_then(|c| c.get("content_type"))
                .and_then(Value::as_str)
                .map(str::to_owned);

            let issue = match content {
                None => {
                    stats.null_content += 1;
                    Some("None content")
                }
                Some(c) => match c.get("parts") {
                    Some(Value::Null) => {
                        stats.null_parts += 1;
                        Some("None parts")
                    }
                    Some(Value::Array(items)) if items.is_empty() => {
                        stats.empty_parts += 1;
                        None
                    }
                    _ => None,
                },
            };
            if let Some(issue) = issue {
                if stats.problematic_nodes.len() < NODE_SAMPLE_LIMIT {
                    stats.problematic_nodes.push(ProblemNode {
                        node_id: truncate_chars(node_id, 8),
                        role,
                        content_type,
                        issue,
                    });
                }
            }
        }
        stats
    }

    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.null_content > 0 {
            issues.push(format!("None content in {} messages", self.null_content));
        }
        if self.null_parts > 0 {
            issues.push(format!("None parts in {} messages", self.null_parts));
        }
        if self.empty_parts > 0 {
            issues.push(format!("Empty parts in {} messages", self.empty_parts));
        }
        if !self.has_mapping {
            issues.push("Missing mapping".to_owned());
        }
        if !self.has_current_node {
            issues.push("Missing current_node".to_owned());
        } else if !self.current_node_valid {
            issues.push("Invalid current_node".to_owned());
        }
        if self.has_mapping && self.leaf_count == 0 {
            issues.push("No leaf nodes".to_owned());
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stats_count_null_and_empty_parts() {
        let record = json!({
            "id": "c1",
            "current_node": "gone",
            "mapping": {
                "root": {"children": ["a"], "message": null},
                "a": {"children": ["b"], "message": {"author": {"role": "user"}, "content": null}},
                "b": {"children": ["c"], "message": {"author": {"role": "assistant"},
                      "content": {"content_type": "text", "parts": null}}},
                "c": {"children": [], "message": {"author": {"role": "assistant"},
                      "content": {"content_type": "text", "parts": []}}}
            }
        });
        let stats = StructuralStats::collect(&record);
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.leaf_count, 1);
        assert_eq!(stats.null_content, 1);
        assert_eq!(stats.null_parts, 1);
        assert_eq!(stats.empty_parts, 1);
        assert_eq!(stats.problematic_nodes.len(), 2);

        let issues = stats.issues();
        assert!(issues.contains(&"Invalid current_node".to_owned()));
        assert!(issues.contains(&"None parts in 1 messages".to_owned()));
    }

    #[test]
    fn failure_truncates_title_and_message() {
        let title = "t".repeat(80);
        let message = "m".repeat(900);
        let failure = ExtractionFailure::new(
            &json!({}),
            "c1",
            &title,
            FailureCategory::Structural,
            &message,
        );
        assert_eq!(failure.title.chars().count(), TITLE_LIMIT);
        assert_eq!(failure.message.chars().count(), MESSAGE_LIMIT);
        assert!(failure.structural_issues.contains(&"Missing mapping".to_owned()));
        assert!(failure.to_string().starts_with("structural failure in conversation c1"));
    }
}
