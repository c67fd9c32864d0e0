use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a normalized message. Tool output only survives as `Assistant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_index: Option<u64>,
}

/// One entry of a linear transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Position on the traversed path before any filtering.
    #[serde(default)]
    pub graph_index: usize,
    #[serde(skip)]
    pub recipient: Option<String>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>, graph_index: usize) -> Self {
        Self {
            role,
            text: text.into(),
            citations: Vec::new(),
            web_urls: Vec::new(),
            files: Vec::new(),
            timestamp: None,
            graph_index,
            recipient: None,
        }
    }

    /// Addressed to the user rather than to a tool.
    pub fn is_user_facing(&self) -> bool {
        matches!(self.recipient.as_deref(), None | Some("all"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomInstructions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about_user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about_model_message: Option<String>,
}

impl CustomInstructions {
    pub fn is_empty(&self) -> bool {
        self.about_user_message.is_none() && self.about_model_message.is_none()
    }
}

/// A conversation reduced to its active path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub project_id: Option<String>,
    pub model: Option<String>,
    pub starred: bool,
    pub archived: bool,
    pub chat_url: String,
    /// Content types seen on the active path, sorted.
    pub content_types: Vec<String>,
    pub code_messages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<CustomInstructions>,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Timestamp used for file modification times.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.update_time.or(self.create_time)
    }
}

pub const DEFAULT_TITLE: &str = "Untitled Conversation";

pub fn chat_url(id: &str) -> String {
    format!("https://chatgpt.com/c/{id}")
}

/// Export timestamps are fractional unix seconds.
pub fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let millis = (seconds * 1000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Truncates on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_seconds_keep_millis() {
        let ts = from_unix_seconds(1_700_000_000.1234).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
        assert!(from_unix_seconds(f64::NAN).is_none());
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate_chars("héllo wörld", 7), "héllo w");
        assert_eq!(truncate_chars("short", 50), "short");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn user_facing_recipients() {
        let mut msg = Message::new(Role::Assistant, "hi", 0);
        assert!(msg.is_user_facing());
        msg.recipient = Some("all".into());
        assert!(msg.is_user_facing());
        msg.recipient = Some("python".into());
        assert!(!msg.is_user_facing());
    }

    #[test]
    fn message_serializes_graph_index_but_not_recipient() {
        let mut msg = Message::new(Role::User, "hello", 4);
        msg.recipient = Some("browser".into());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["graph_index"], 4);
        assert!(json.get("recipient").is_none());
        assert!(json.get("citations").is_none());
    }
}
