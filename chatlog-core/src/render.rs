//! Markdown and JSON renderings of a normalized conversation.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::conversation::{Citation, Conversation, CustomInstructions, Message, Role};
use crate::error::{ChatlogError, Result};

fn iso(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

fn is_empty_slice<T>(items: &&[T]) -> bool {
    items.is_empty()
}

/// YAML header of a Markdown transcript.
#[derive(Debug, Serialize)]
struct FrontMatter<'a> {
    id: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "is_false")]
    starred: bool,
    #[serde(skip_serializing_if = "is_false")]
    archived: bool,
    chat_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    total_messages: usize,
    code_messages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_types: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_instructions: Option<&'a CustomInstructions>,
}

impl<'a> FrontMatter<'a> {
    fn new(conv: &'a Conversation) -> Self {
        Self {
            id: &conv.id,
            title: &conv.title,
            created: iso(conv.create_time),
            updated: iso(conv.update_time),
            model: conv.model.as_deref(),
            starred: conv.starred,
            archived: conv.archived,
            chat_url: &conv.chat_url,
            project_id: conv.project_id.as_deref(),
            total_messages: conv.messages.len(),
            code_messages: conv.code_messages,
            message_types: (!conv.content_types.is_empty()).then(|| conv.content_types.join(", ")),
            custom_instructions: conv.custom_instructions.as_ref().filter(|ci| !ci.is_empty()),
        }
    }
}

fn citation_line(citation: &Citation) -> String {
    let title = if citation.title.is_empty() {
        "Untitled"
    } else {
        &citation.title
    };
    if citation.url.is_empty() {
        format!("- [{}] {}", citation.kind, title)
    } else {
        format!("- [{}] {} - {}", citation.kind, title, citation.url)
    }
}

fn push_message(md: &mut String, message: &Message) {
    let _ = writeln!(md, "## {}\n", message.role.heading());
    if message.role == Role::User {
        for file in &message.files {
            let _ = writeln!(md, "[File: {file}]");
        }
        if !message.files.is_empty() {
            md.push('\n');
        }
    }
    if !message.text.is_empty() {
        md.push_str(&message.text);
        md.push('\n');
    }
    if !message.citations.is_empty() {
        md.push_str("\n**Citations:**\n");
        for citation in &message.citations {
            md.push_str(&citation_line(citation));
            md.push('\n');
        }
    }
    if !message.web_urls.is_empty() {
        md.push_str("\n**Web Search URLs:**\n");
        for url in &message.web_urls {
            let _ = writeln!(md, "- {url}");
        }
    }
    md.push('\n');
}

/// Transcript with YAML front matter, one `##` section per message.
pub fn render_markdown(conv: &Conversation) -> Result<String> {
    let yaml = serde_yaml::to_string(&FrontMatter::new(conv))?;

    let mut md = String::with_capacity(yaml.len() + 256);
    md.push_str("---\n");
    md.push_str(&yaml);
    md.push_str("---\n\n");
    let _ = writeln!(md, "# {}\n", conv.title);
    for message in &conv.messages {
        push_message(&mut md, message);
    }
    Ok(md)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDocument<'a> {
    pub role: &'static str,
    pub content: &'a str,
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    pub citations: &'a [Citation],
    #[serde(skip_serializing_if = "is_empty_slice")]
    pub web_urls: &'a [String],
    #[serde(skip_serializing_if = "is_empty_slice")]
    pub files: &'a [String],
    pub graph_index: usize,
}

/// Per-conversation JSON shape, shared by multiple-file and single-file output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationDocument<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub model: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub total_messages: usize,
    pub code_messages: usize,
    pub message_types: &'a [String],
    pub starred: bool,
    pub archived: bool,
    pub chat_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<&'a CustomInstructions>,
    pub messages: Vec<MessageDocument<'a>>,
}

impl<'a> ConversationDocument<'a> {
    pub fn new(conv: &'a Conversation) -> Self {
        Self {
            id: &conv.id,
            title: &conv.title,
            created: iso(conv.create_time),
            updated: iso(conv.update_time),
            model: conv.model.as_deref(),
            project_id: conv.project_id.as_deref(),
            total_messages: conv.messages.len(),
            code_messages: conv.code_messages,
            message_types: &conv.content_types,
            starred: conv.starred,
            archived: conv.archived,
            chat_url: &conv.chat_url,
            custom_instructions: conv.custom_instructions.as_ref().filter(|ci| !ci.is_empty()),
            messages: conv
                .messages
                .iter()
                .map(|m| MessageDocument {
                    role: m.role.as_str(),
                    content: &m.text,
                    timestamp: iso(m.timestamp),
                    citations: &m.citations,
                    web_urls: &m.web_urls,
                    files: &m.files,
                    graph_index: m.graph_index,
                })
                .collect(),
        }
    }
}

pub fn render_json(conv: &Conversation) -> Result<String> {
    serde_json::to_string_pretty(&ConversationDocument::new(conv))
        .map_err(|e| ChatlogError::json(format!("conversation {}", conv.id), e))
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportMetadata {
    pub timestamp: String,
    pub total_conversations: usize,
    pub successful_conversations: usize,
    pub failed_conversations: usize,
    pub extractor_version: &'static str,
    pub export_format: &'static str,
    pub source_file: String,
    pub timestamp_sync_enabled: bool,
}

impl ExportMetadata {
    pub fn new(
        generated_at: DateTime<Utc>,
        successful: usize,
        failed: usize,
        source_file: impl Into<String>,
        timestamp_sync_enabled: bool,
    ) -> Self {
        Self {
            timestamp: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            total_conversations: successful,
            successful_conversations: successful,
            failed_conversations: failed,
            extractor_version: env!("CARGO_PKG_VERSION"),
            export_format: "single",
            source_file: source_file.into(),
            timestamp_sync_enabled,
        }
    }
}

/// Wrapper written when every conversation goes into one JSON file.
#[derive(Debug, Serialize)]
pub struct ExportDocument<'a> {
    pub export_metadata: ExportMetadata,
    pub conversations: Vec<ConversationDocument<'a>>,
}

impl<'a> ExportDocument<'a> {
    pub fn new(metadata: ExportMetadata, conversations: &'a [Conversation]) -> Self {
        Self {
            export_metadata: metadata,
            conversations: conversations.iter().map(ConversationDocument::new).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{chat_url, from_unix_seconds};

    fn sample() -> Conversation {
        let mut user = Message::new(Role::User, "What is: YAML?", 0);
        user.files = vec!["notes.txt".into()];
        let mut reply = Message::new(Role::Assistant, "A data format.", 1);
        reply.timestamp = from_unix_seconds(1_700_000_100.0);
        reply.citations = vec![
            Citation {
                kind: "webpage".into(),
                title: "YAML reference".into(),
                url: "https://yaml.org".into(),
                quoted_text: None,
                start_index: Some(0),
                end_index: Some(4),
            },
            Citation {
                kind: "unknown".into(),
                title: String::new(),
                url: String::new(),
                quoted_text: Some("q".into()),
                start_index: None,
                end_index: None,
            },
        ];
        reply.web_urls = vec!["https://yaml.org".into()];
        Conversation {
            id: "abc".into(),
            title: "Formats: \"YAML\" vs JSON".into(),
            create_time: from_unix_seconds(1_700_000_000.0),
            update_time: None,
            project_id: Some("g-p-42".into()),
            model: Some("gpt-4o".into()),
            starred: true,
            archived: false,
            chat_url: chat_url("abc"),
            content_types: vec!["text".into()],
            code_messages: 0,
            custom_instructions: Some(CustomInstructions {
                about_user_message: Some("I write: docs".into()),
                about_model_message: None,
            }),
            messages: vec![user, reply],
        }
    }

    #[test]
    fn markdown_has_parseable_front_matter() {
        let md = render_markdown(&sample()).unwrap();
        let yaml = md
            .strip_prefix("---\n")
            .and_then(|rest| rest.split_once("---\n"))
            .map(|(yaml, _)| yaml)
            .unwrap();
        let front: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(front["title"].as_str(), Some("Formats: \"YAML\" vs JSON"));
        assert_eq!(front["created"].as_str(), Some("2023-11-14T22:13:20Z"));
        assert_eq!(front["starred"].as_bool(), Some(true));
        assert!(front.get("archived").is_none());
        assert!(front.get("updated").is_none());
        assert_eq!(front["message_types"].as_str(), Some("text"));
        assert_eq!(
            front["custom_instructions"]["about_user_message"].as_str(),
            Some("I write: docs")
        );
    }

    #[test]
    fn markdown_sections() {
        let md = render_markdown(&sample()).unwrap();
        assert!(md.contains("# Formats: \"YAML\" vs JSON\n"));
        assert!(md.contains("## User\n\n[File: notes.txt]\n\nWhat is: YAML?\n"));
        assert!(md.contains("## Assistant\n\nA data format.\n"));
        assert!(md.contains("**Citations:**\n- [webpage] YAML reference - https://yaml.org\n- [unknown] Untitled\n"));
        assert!(md.contains("**Web Search URLs:**\n- https://yaml.org\n"));
    }

    #[test]
    fn json_document_shape() {
        let conv = sample();
        let json: serde_json::Value = serde_json::from_str(&render_json(&conv).unwrap()).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["total_messages"], 2);
        assert_eq!(json["message_types"], serde_json::json!(["text"]));
        assert_eq!(json["updated"], serde_json::Value::Null);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["timestamp"], serde_json::Value::Null);
        assert_eq!(json["messages"][0]["files"][0], "notes.txt");
        assert!(json["messages"][0].get("citations").is_none());
        assert_eq!(json["messages"][1]["timestamp"], "2023-11-14T22:15:00Z");
        assert_eq!(json["messages"][1]["citations"][0]["type"], "webpage");
        assert_eq!(json["messages"][0]["graph_index"], 0);
        assert_eq!(json["messages"][1]["graph_index"], 1);
    }

    #[test]
    fn export_wrapper_counts() {
        let convs = vec![sample()];
        let meta = ExportMetadata::new(Utc::now(), convs.len(), 3, "conversations.json", true);
        let doc = serde_json::to_value(ExportDocument::new(meta, &convs)).unwrap();
        assert_eq!(doc["export_metadata"]["successful_conversations"], 1);
        assert_eq!(doc["export_metadata"]["failed_conversations"], 3);
        assert_eq!(doc["export_metadata"]["export_format"], "single");
        assert_eq!(doc["conversations"][0]["chat_url"], "https://chatgpt.com/c/abc");
    }
}
