//! Typed view of one record from a ChatGPT `conversations.json` export.
//!
//! The export is a DAG per conversation: `mapping` holds every node ever
//! created (edits and regenerations included) and `current_node` points at
//! the leaf the UI was showing. Everything here is parsed once and dropped
//! after normalization.
//!
//! Decoding is lenient below the record level. A field with the wrong shape
//! reads as absent, non-string `children` entries are dropped, and a node
//! that is not an object is left out of the mapping, each with a warning.
//! Only a record or `mapping` that is not an object fails to decode.
//!
//! Message bodies are decoded into [`Content`] by hand rather than by derive,
//! so an unexpected shape in one body never fails the whole record.
//! Known content types whose fields do not match become
//! [`RawContent::Malformed`]; unrecognized tags become [`RawContent::Unknown`].

use std::collections::HashMap;

use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::warn;

pub type NodeId = String;
pub type Mapping = HashMap<NodeId, RawNode>;

/// One conversation as exported.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConversation {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub conversation_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub create_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub update_time: Option<f64>,
    #[serde(default, deserialize_with = "mapping_nodes")]
    pub mapping: Option<Mapping>,
    #[serde(default, deserialize_with = "lenient")]
    pub current_node: Option<NodeId>,
    #[serde(default, deserialize_with = "lenient")]
    pub default_model_slug: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub is_starred: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub is_archived: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub conversation_template_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub memory_scope: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub safe_urls: Vec<String>,
}

impl RawConversation {
    /// Decode a conversation record, rejecting shapes the typed model cannot hold.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Best-effort identifier: `id`, then `conversation_id`.
    pub fn best_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.conversation_id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNode {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<NodeId>,
    #[serde(default, deserialize_with = "lenient")]
    pub parent: Option<NodeId>,
    #[serde(default, deserialize_with = "string_list")]
    pub children: Vec<NodeId>,
    #[serde(default, deserialize_with = "lenient")]
    pub message: Option<RawMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub author: RawAuthor,
    #[serde(default, deserialize_with = "content_from_value")]
    pub content: Option<Content>,
    #[serde(default, deserialize_with = "lenient")]
    pub weight: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub recipient: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub create_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub update_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub end_turn: Option<bool>,
}

impl RawMessage {
    pub fn role(&self) -> AuthorRole {
        AuthorRole::parse(self.author.role.as_deref())
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    fn meta_flag(&self, key: &str) -> bool {
        self.meta(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn is_visually_hidden(&self) -> bool {
        self.meta_flag("is_visually_hidden_from_conversation")
    }

    pub fn is_user_system_message(&self) -> bool {
        self.meta_flag("is_user_system_message")
    }

    /// Content type tag, if the message has a body.
    pub fn content_type(&self) -> Option<&str> {
        self.content.as_ref().map(|c| c.body.content_type())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAuthor {
    #[serde(default, deserialize_with = "lenient")]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorRole {
    System,
    User,
    Assistant,
    Tool,
    Other(String),
    Missing,
}

impl AuthorRole {
    pub fn parse(role: Option<&str>) -> Self {
        match role {
            Some("system") => Self::System,
            Some("user") => Self::User,
            Some("assistant") => Self::Assistant,
            Some("tool") => Self::Tool,
            Some(other) => Self::Other(other.to_owned()),
            None => Self::Missing,
        }
    }
}

/// A message body: the typed variant plus the untyped fields it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub body: RawContent,
    pub raw: Map<String, Value>,
}

impl Content {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(raw) => Self {
                body: RawContent::from_fields(&raw),
                raw,
            },
            other => Self {
                body: RawContent::Malformed {
                    body: LooseContent::default(),
                    reason: format!("content is {}, expected an object", json_kind(&other)),
                },
                raw: Map::new(),
            },
        }
    }

    pub fn content_type(&self) -> &str {
        self.body.content_type()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    /// `url`, whatever the body type.
    pub fn url(&self) -> Option<&str> {
        self.str_field("url")
    }

    pub fn domain(&self) -> Option<&str> {
        self.str_field("domain")
    }

    /// Free-text `result` of browsing displays.
    pub fn result(&self) -> Option<&str> {
        self.str_field("result")
    }

    /// Text carried by the raw `parts` array: plain strings and `text` fields of part objects.
    pub fn part_texts(&self) -> impl Iterator<Item = &str> {
        self.raw
            .get("parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(fields) => fields.get("text").and_then(Value::as_str),
                _ => None,
            })
    }
}

/// Message body, keyed by `content_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum RawContent {
    Text {
        parts: Parts,
    },
    Code {
        language: Option<String>,
        text: Option<String>,
    },
    MultimodalText {
        parts: Parts,
    },
    ExecutionOutput {
        text: Option<String>,
    },
    TetherQuote(WebSnippet),
    SonicWebpage(WebSnippet),
    TetherBrowsingDisplay {
        result: Option<String>,
        summary: Option<String>,
        url: Option<String>,
    },
    UserEditableContext {
        user_profile: Option<String>,
        user_instructions: Option<String>,
        text: Option<String>,
    },
    ModelEditableContext,
    Thoughts,
    ReasoningRecap,
    SystemError {
        name: Option<String>,
        text: Option<String>,
    },
    /// A known tag whose fields had an unexpected shape.
    Malformed {
        body: LooseContent,
        reason: String,
    },
    /// A tag this model does not know.
    Unknown(LooseContent),
}

/// Shared by `tether_quote` and `sonic_webpage`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebSnippet {
    pub url: Option<String>,
    pub domain: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
}

/// Untyped body kept for the generic fallback path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LooseContent {
    pub content_type: String,
    pub text: Option<String>,
    pub parts: Parts,
    pub fields: Map<String, Value>,
}

impl LooseContent {
    fn from_fields(content_type: &str, fields: &Map<String, Value>) -> Self {
        Self {
            content_type: content_type.to_owned(),
            text: fields.get("text").and_then(Value::as_str).map(str::to_owned),
            parts: Parts::decode(fields.get("parts")).unwrap_or(Parts::Absent),
            fields: fields.clone(),
        }
    }
}

/// `parts` has three valid states besides a populated list; keep them apart.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Parts {
    #[default]
    Absent,
    Null,
    Items(Vec<Part>),
}

impl Parts {
    pub fn items(&self) -> &[Part] {
        match self {
            Self::Items(items) => items,
            Self::Absent | Self::Null => &[],
        }
    }

    /// `[""]`: the placeholder an assistant emits right before a tool call.
    pub fn is_empty_placeholder(&self) -> bool {
        matches!(self.items(), [Part::Text(s)] if s.is_empty())
    }

    fn decode(value: Option<&Value>) -> Result<Self, String> {
        match value {
            None => Ok(Self::Absent),
            Some(Value::Null) => Ok(Self::Null),
            Some(Value::Array(items)) => Ok(Self::Items(
                items.iter().cloned().map(Part::from_value).collect(),
            )),
            Some(other) => Err(format!("`parts` is {}, expected an array", json_kind(other))),
        }
    }
}

/// One element of `parts`.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    AudioTranscription {
        text: Option<String>,
    },
    Asset(AssetPointer),
    CodeInterpreterOutput {
        output: Option<String>,
    },
    Null,
    Other {
        content_type: Option<String>,
        fields: Map<String, Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Audio,
    Video,
    RealTimeAudioVideo,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image_asset_pointer",
            Self::Audio => "audio_asset_pointer",
            Self::Video => "video_asset_pointer",
            Self::RealTimeAudioVideo => "real_time_user_audio_video_asset_pointer",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetPointer {
    pub kind: AssetKind,
    pub asset_pointer: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl AssetPointer {
    /// Image generation results carry a `dalle` or `dalle_prompt` metadata key.
    pub fn is_dalle(&self) -> bool {
        self.kind == AssetKind::Image
            && self
                .metadata
                .as_ref()
                .is_some_and(|m| m.contains_key("dalle") || m.contains_key("dalle_prompt"))
    }
}

impl Part {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Null => Self::Null,
            Value::Object(mut fields) => {
                let content_type = fields
                    .get("content_type")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                let take_str = |fields: &mut Map<String, Value>, key: &str| match fields.remove(key) {
                    Some(Value::String(s)) => Some(s),
                    _ => None,
                };
                let asset = |kind, mut fields: Map<String, Value>| {
                    Self::Asset(AssetPointer {
                        kind,
                        asset_pointer: fields
                            .get("asset_pointer")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                        metadata: match fields.remove("metadata") {
                            Some(Value::Object(m)) => Some(m),
                            _ => None,
                        },
                    })
                };
                match content_type.clone().as_deref() {
                    Some("audio_transcription") => Self::AudioTranscription {
                        text: take_str(&mut fields, "text"),
                    },
                    Some("code_interpreter_output") => Self::CodeInterpreterOutput {
                        output: take_str(&mut fields, "output"),
                    },
                    Some("image_asset_pointer") => asset(AssetKind::Image, fields),
                    Some("audio_asset_pointer") => asset(AssetKind::Audio, fields),
                    Some("video_asset_pointer") => asset(AssetKind::Video, fields),
                    Some("real_time_user_audio_video_asset_pointer") => {
                        asset(AssetKind::RealTimeAudioVideo, fields)
                    }
                    _ => Self::Other {
                        content_type,
                        fields,
                    },
                }
            }
            other => {
                let mut fields = Map::new();
                fields.insert("value".to_owned(), other);
                Self::Other {
                    content_type: None,
                    fields,
                }
            }
        }
    }

    /// Tag used when reporting this part to the schema registry.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Text(_) | Self::Null => None,
            Self::AudioTranscription { .. } => Some("audio_transcription"),
            Self::CodeInterpreterOutput { .. } => Some("code_interpreter_output"),
            Self::Asset(asset) => Some(asset.kind.as_str()),
            Self::Other { content_type, .. } => Some(content_type.as_deref().unwrap_or("<untagged>")),
        }
    }
}

impl RawContent {
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let content_type = fields
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match Self::decode_known(content_type, fields) {
            Ok(Some(content)) => content,
            Ok(None) => Self::Unknown(LooseContent::from_fields(content_type, fields)),
            Err(reason) => Self::Malformed {
                body: LooseContent::from_fields(content_type, fields),
                reason,
            },
        }
    }

    fn decode_known(tag: &str, f: &Map<String, Value>) -> Result<Option<Self>, String> {
        let parts = || Parts::decode(f.get("parts"));
        let snippet = || -> Result<WebSnippet, String> {
            Ok(WebSnippet {
                url: opt_str(f, "url")?,
                domain: opt_str(f, "domain")?,
                title: opt_str(f, "title")?,
                text: opt_str(f, "text")?,
            })
        };
        let content = match tag {
            "text" => Self::Text { parts: parts()? },
            "multimodal_text" => Self::MultimodalText { parts: parts()? },
            "code" => Self::Code {
                language: opt_str(f, "language")?,
                text: opt_str(f, "text")?,
            },
            "execution_output" => Self::ExecutionOutput {
                text: opt_str(f, "text")?,
            },
            "tether_quote" => Self::TetherQuote(snippet()?),
            "sonic_webpage" => Self::SonicWebpage(snippet()?),
            "tether_browsing_display" => Self::TetherBrowsingDisplay {
                result: opt_str(f, "result")?,
                summary: opt_str(f, "summary")?,
                url: opt_str(f, "url")?,
            },
            "user_editable_context" => Self::UserEditableContext {
                user_profile: opt_str(f, "user_profile")?,
                user_instructions: opt_str(f, "user_instructions")?,
                text: opt_str(f, "text")?,
            },
            "model_editable_context" => Self::ModelEditableContext,
            "thoughts" => Self::Thoughts,
            "reasoning_recap" => Self::ReasoningRecap,
            "system_error" => Self::SystemError {
                name: opt_str(f, "name")?,
                text: opt_str(f, "text")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(content))
    }

    pub fn content_type(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::Code { .. } => "code",
            Self::MultimodalText { .. } => "multimodal_text",
            Self::ExecutionOutput { .. } => "execution_output",
            Self::TetherQuote(_) => "tether_quote",
            Self::SonicWebpage(_) => "sonic_webpage",
            Self::TetherBrowsingDisplay { .. } => "tether_browsing_display",
            Self::UserEditableContext { .. } => "user_editable_context",
            Self::ModelEditableContext => "model_editable_context",
            Self::Thoughts => "thoughts",
            Self::ReasoningRecap => "reasoning_recap",
            Self::SystemError { .. } => "system_error",
            Self::Malformed { body, .. } => &body.content_type,
            Self::Unknown(body) => &body.content_type,
        }
    }

    /// The `parts` sequence, for variants that carry one.
    pub fn parts(&self) -> &Parts {
        static ABSENT: Parts = Parts::Absent;
        match self {
            Self::Text { parts } | Self::MultimodalText { parts } => parts,
            Self::Malformed { body, .. } | Self::Unknown(body) => &body.parts,
            _ => &ABSENT,
        }
    }
}

fn opt_str(fields: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("`{key}` is {}, expected a string", json_kind(other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `null` and values of the wrong shape both read as `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(err) => {
            warn!(error = %err, "ignoring malformed field");
            Ok(None)
        }
    }
}

fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + DeserializeOwned,
{
    Ok(lenient(deserializer)?.unwrap_or_default())
}

/// Epoch seconds. Numeric strings and RFC 3339 dates are converted.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_timestamp(&s),
        _ => None,
    };
    if parsed.is_none() {
        warn!("ignoring unreadable timestamp");
    }
    Ok(parsed)
}

fn parse_timestamp(s: &str) -> Option<f64> {
    let s = s.trim();
    s.parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
        })
}

/// String entries of an array; anything else in it is dropped.
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => {
            warn!(found = json_kind(&other), "ignoring non-array list");
            return Ok(Vec::new());
        }
    };
    let total = items.len();
    let strings: Vec<String> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            _ => None,
        })
        .collect();
    if strings.len() < total {
        warn!(dropped = total - strings.len(), "ignoring non-string list entries");
    }
    Ok(strings)
}

/// `mapping` must be an object; nodes inside it that are not objects are left out.
fn mapping_nodes<'de, D>(deserializer: D) -> Result<Option<Mapping>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(nodes) = Option::<Map<String, Value>>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let mut mapping = Mapping::with_capacity(nodes.len());
    for (id, node) in nodes {
        match serde_json::from_value::<RawNode>(node) {
            Ok(node) => {
                mapping.insert(id, node);
            }
            Err(err) => warn!(node = %id, error = %err, "dropping malformed node"),
        }
    }
    Ok(Some(mapping))
}

fn content_from_value<'de, D>(deserializer: D) -> Result<Option<Content>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.map(Content::from_value))
}
