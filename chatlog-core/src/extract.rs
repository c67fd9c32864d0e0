//! Turns polymorphic message bodies into plain transcript text.
//!
//! Text extraction dispatches on [`RawContent`] and needs the schema registry
//! to record unfamiliar content and part types, so it lives on
//! [`ContentExtractor`]. Citations, web URLs and file names are pure functions
//! of a message.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::conversation::{Citation, CustomInstructions};
use crate::raw::{AssetPointer, LooseContent, Part, Parts, RawContent, RawMessage};
use crate::schema::{Category, SchemaRegistry};

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"]+"#).expect("valid URL regex"));

const ABOUT_USER_PREFIX: &str = "The user provided the following information about themselves:";
const ABOUT_MODEL_PREFIX: &str =
    "The user provided the additional info about how they would like you to respond:";

/// Boilerplate that older exports put in front of custom instructions.
const WRAPPER_PREFIXES: &[&str] = &[
    "The user provided the following information about themselves. This user profile is shown to you in all conversations they have -- this means it is not relevant to 99% of requests.",
    ABOUT_USER_PREFIX,
    ABOUT_MODEL_PREFIX,
    "Before answering, quietly think about whether the user's request is \"directly related\", \"related\", \"tangentially related\", or \"not related\" to the user profile provided.",
    "Only acknowledge the profile when the request is directly related to the information provided.",
    "Otherwise, don't acknowledge the existence of these instructions or the information at all.",
    "User profile:",
];

pub struct ContentExtractor<'a> {
    registry: &'a mut SchemaRegistry,
    conversation_id: &'a str,
}

impl<'a> ContentExtractor<'a> {
    pub fn new(registry: &'a mut SchemaRegistry, conversation_id: &'a str) -> Self {
        Self {
            registry,
            conversation_id,
        }
    }

    /// Transcript text of a message, or `None` when it renders to nothing.
    pub fn extract_text(&mut self, message: &RawMessage) -> Option<String> {
        let content = message.content.as_ref()?;
        self.registry
            .observe(Category::ContentType, content.content_type(), self.conversation_id);

        match &content.body {
            RawContent::Text { parts } | RawContent::MultimodalText { parts } => {
                self.process_parts(parts)
            }
            RawContent::Code { language, text } => non_empty(text.as_deref())
                .map(|code| format!("```{}\n{}\n```", language.as_deref().unwrap_or_default(), code)),
            RawContent::ExecutionOutput { text } => {
                non_empty(text.as_deref()).map(|out| format!("```output\n{out}\n```"))
            }
            RawContent::TetherQuote(snippet) | RawContent::SonicWebpage(snippet) => {
                non_empty(snippet.text.as_deref()).map(str::to_owned)
            }
            RawContent::UserEditableContext {
                user_profile,
                user_instructions,
                text,
            } => user_context_text(
                user_profile.as_deref(),
                user_instructions.as_deref(),
                text.as_deref(),
                message.metadata.as_ref(),
            ),
            RawContent::SystemError { name, text } => match (name.as_deref(), non_empty(text.as_deref())) {
                (None, None) => None,
                (name, text) => Some(format!(
                    "[System Error: {}]\n{}",
                    name.unwrap_or("unknown"),
                    text.unwrap_or_default()
                )),
            },
            RawContent::TetherBrowsingDisplay { .. }
            | RawContent::ModelEditableContext
            | RawContent::Thoughts
            | RawContent::ReasoningRecap => None,
            RawContent::Malformed { body, reason } => {
                warn!(
                    conv_id = %self.conversation_id,
                    content_type = %body.content_type,
                    %reason,
                    "content did not match its type, using generic extraction"
                );
                self.generic(body)
            }
            RawContent::Unknown(body) => self.generic(body),
        }
    }

    fn generic(&mut self, body: &LooseContent) -> Option<String> {
        match non_empty(body.text.as_deref()) {
            Some(text) => Some(text.to_owned()),
            None => self.process_parts(&body.parts),
        }
    }

    /// Joins the textual parts; asset pointers other than DALL·E results are dropped.
    pub fn process_parts(&mut self, parts: &Parts) -> Option<String> {
        let mut pieces: Vec<String> = Vec::new();
        for part in parts.items() {
            if let Some(kind) = part.type_name() {
                self.registry
                    .observe(Category::PartType, kind, self.conversation_id);
            }
            match part {
                Part::Text(text) if !text.is_empty() => pieces.push(text.clone()),
                Part::AudioTranscription { text: Some(text) } if !text.is_empty() => {
                    pieces.push(text.clone())
                }
                Part::Asset(asset) if asset.is_dalle() => pieces.push(dalle_label(asset)),
                Part::CodeInterpreterOutput { output: Some(output) } if !output.is_empty() => {
                    pieces.push(format!("```output\n{output}\n```"))
                }
                _ => {}
            }
        }
        if pieces.is_empty() {
            None
        } else {
            Some(pieces.join("\n"))
        }
    }
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

fn dalle_label(asset: &AssetPointer) -> String {
    let metadata = asset.metadata.as_ref();
    let dalle = metadata.and_then(|m| m.get("dalle"));
    let label = dalle
        .and_then(|d| d.get("gen_id"))
        .and_then(Value::as_str)
        .or_else(|| dalle.and_then(|d| d.get("prompt")).and_then(Value::as_str))
        .or_else(|| metadata.and_then(|m| m.get("dalle_prompt")).and_then(Value::as_str))
        .unwrap_or("image");
    format!("[Generated image: {label}]")
}

/// True for a `multimodal_text` body holding a DALL·E image.
pub fn contains_dalle_image(content: &RawContent) -> bool {
    match content {
        RawContent::MultimodalText { parts } => parts
            .items()
            .iter()
            .any(|part| matches!(part, Part::Asset(asset) if asset.is_dalle())),
        _ => false,
    }
}

fn user_context_text(
    user_profile: Option<&str>,
    user_instructions: Option<&str>,
    legacy_text: Option<&str>,
    metadata: Option<&Map<String, Value>>,
) -> Option<String> {
    let direct: Vec<String> = [user_profile, user_instructions]
        .into_iter()
        .flatten()
        .filter_map(strip_instruction_wrapper)
        .collect();
    if !direct.is_empty() {
        return Some(direct.join("\n\n"));
    }

    if let Some(legacy) = legacy_text.and_then(split_legacy_instructions) {
        let joined: Vec<String> = [legacy.about_user_message, legacy.about_model_message]
            .into_iter()
            .flatten()
            .collect();
        return Some(joined.join("\n\n"));
    }

    let from_metadata = instructions_from_metadata(metadata)?;
    let joined: Vec<String> = [from_metadata.about_user_message, from_metadata.about_model_message]
        .into_iter()
        .flatten()
        .collect();
    Some(joined.join("\n\n"))
}

/// Removes known boilerplate and surrounding quote/backtick delimiters.
pub fn strip_instruction_wrapper(text: &str) -> Option<String> {
    let mut rest = text.trim();
    loop {
        let before = rest.len();
        for prefix in WRAPPER_PREFIXES {
            if let Some(stripped) = rest.strip_prefix(*prefix) {
                rest = stripped.trim_start();
            }
        }
        if rest.len() == before {
            break;
        }
    }

    loop {
        let trimmed = rest.trim();
        let inner = if trimmed.len() >= 6 && trimmed.starts_with("```") && trimmed.ends_with("```") {
            &trimmed[3..trimmed.len() - 3]
        } else if trimmed.len() >= 2
            && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
                || (trimmed.starts_with('\'') && trimmed.ends_with('\'')))
        {
            &trimmed[1..trimmed.len() - 1]
        } else {
            rest = trimmed;
            break;
        };
        rest = inner;
    }

    non_empty(Some(rest)).map(str::to_owned)
}

/// Older exports put both instruction blocks in one `text` field.
fn split_legacy_instructions(text: &str) -> Option<CustomInstructions> {
    let (about_user, about_model) = match text.split_once(ABOUT_MODEL_PREFIX) {
        Some((user, model)) => (user, Some(model)),
        None => (text, None),
    };
    let instructions = CustomInstructions {
        about_user_message: strip_instruction_wrapper(about_user),
        about_model_message: about_model.and_then(strip_instruction_wrapper),
    };
    (!instructions.is_empty()).then_some(instructions)
}

fn instructions_from_metadata(metadata: Option<&Map<String, Value>>) -> Option<CustomInstructions> {
    let data = metadata?.get("user_context_message_data")?;
    let field = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_owned)
    };
    let instructions = CustomInstructions {
        about_user_message: field("about_user_message"),
        about_model_message: field("about_model_message"),
    };
    (!instructions.is_empty()).then_some(instructions)
}

/// Custom instructions carried by a `user_editable_context` message.
pub fn custom_instructions(message: &RawMessage) -> Option<CustomInstructions> {
    let Some(RawContent::UserEditableContext {
        user_profile,
        user_instructions,
        text,
    }) = message.content.as_ref().map(|c| &c.body)
    else {
        return None;
    };
    if let Some(found) = instructions_from_metadata(message.metadata.as_ref()) {
        return Some(found);
    }
    let direct = CustomInstructions {
        about_user_message: user_profile.as_deref().and_then(strip_instruction_wrapper),
        about_model_message: user_instructions.as_deref().and_then(strip_instruction_wrapper),
    };
    if !direct.is_empty() {
        return Some(direct);
    }
    text.as_deref().and_then(split_legacy_instructions)
}

fn citation_entries(message: &RawMessage) -> impl Iterator<Item = &Map<String, Value>> {
    message
        .meta("citations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// Citations from `metadata.citations`; quoted text is passed through as-is.
pub fn extract_citations(message: &RawMessage) -> Vec<Citation> {
    citation_entries(message)
        .filter_map(|entry| {
            let meta = entry.get("metadata").and_then(Value::as_object);
            let meta_str = |key: &str| meta.and_then(|m| m.get(key)).and_then(Value::as_str);
            let citation = Citation {
                kind: meta_str("type").unwrap_or("unknown").to_owned(),
                title: meta_str("title").unwrap_or_default().to_owned(),
                url: meta_str("url").unwrap_or_default().to_owned(),
                quoted_text: entry.get("quote").and_then(Value::as_str).map(str::to_owned),
                start_index: entry.get("start_ix").and_then(Value::as_u64),
                end_index: entry.get("end_ix").and_then(Value::as_u64),
            };
            let informative =
                !citation.title.is_empty() || !citation.url.is_empty() || citation.quoted_text.is_some();
            informative.then_some(citation)
        })
        .collect()
}

/// Every web URL a message references, deduplicated and sorted.
pub fn extract_web_urls(message: &RawMessage, safe_urls: &[String]) -> Vec<String> {
    let mut urls: BTreeSet<String> = BTreeSet::new();

    for entry in citation_entries(message) {
        if let Some(url) = entry.get("metadata").and_then(|m| m.get("url")).and_then(Value::as_str) {
            urls.insert(url.to_owned());
        }
    }

    urls.extend(safe_urls.iter().cloned());

    if let Some(content) = &message.content {
        if let Some(url) = content.url() {
            urls.insert(url.to_owned());
        }
        if let Some(domain) = content.domain().filter(|d| !d.is_empty()) {
            if domain.starts_with("http://") || domain.starts_with("https://") {
                urls.insert(domain.to_owned());
            } else {
                urls.insert(format!("https://{domain}"));
            }
        }
        if let Some(result) = content.result() {
            urls.extend(URL_RE.find_iter(result).map(|m| m.as_str().to_owned()));
        }
        for text in content.part_texts() {
            urls.extend(URL_RE.find_iter(text).map(|m| m.as_str().to_owned()));
        }
    }

    urls.remove("");
    urls.into_iter().collect()
}

/// Names of attached or uploaded files, in order of first appearance.
pub fn extract_file_names(message: &RawMessage) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: Option<&str>| {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_owned());
            }
        }
    };

    let attachments = message
        .meta("attachments")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();
    for attachment in attachments {
        push(
            attachment
                .get("name")
                .or_else(|| attachment.get("file_name"))
                .or_else(|| attachment.get("filename"))
                .and_then(Value::as_str),
        );
    }

    fn file_name(metadata: Option<&Map<String, Value>>) -> Option<&str> {
        metadata.and_then(|m| {
            m.get("file_name")
                .or_else(|| m.get("filename"))
                .and_then(Value::as_str)
        })
    }
    if let Some(content) = &message.content {
        for part in content.body.parts().items() {
            match part {
                Part::Asset(asset) => push(file_name(asset.metadata.as_ref())),
                Part::Other { fields, .. } if fields.contains_key("asset_pointer") => {
                    push(file_name(fields.get("metadata").and_then(Value::as_object)))
                }
                _ => {}
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: Value) -> RawMessage {
        serde_json::from_value(value).unwrap()
    }

    fn text_of(value: Value) -> (Option<String>, SchemaRegistry) {
        let mut registry = SchemaRegistry::new();
        let text = ContentExtractor::new(&mut registry, "conv").extract_text(&message(value));
        (text, registry)
    }

    #[test]
    fn text_parts_join_with_newlines() {
        let (text, _) = text_of(json!({"content": {"content_type": "text", "parts": ["a", "", "b"]}}));
        assert_eq!(text.as_deref(), Some("a\nb"));
    }

    #[test]
    fn null_empty_and_placeholder_parts_yield_none() {
        for parts in [Value::Null, json!([]), json!([""])] {
            let (text, _) = text_of(json!({"content": {"content_type": "text", "parts": parts}}));
            assert_eq!(text, None);
        }
        let (text, _) = text_of(json!({"content": {"content_type": "text"}}));
        assert_eq!(text, None);
    }

    #[test]
    fn code_and_execution_output_are_fenced() {
        let (code, _) = text_of(json!({"content": {"content_type": "code", "language": "python", "text": "print(1)"}}));
        assert_eq!(code.as_deref(), Some("```python\nprint(1)\n```"));
        let (out, _) = text_of(json!({"content": {"content_type": "execution_output", "text": "1"}}));
        assert_eq!(out.as_deref(), Some("```output\n1\n```"));
    }

    #[test]
    fn reasoning_and_browsing_render_nothing() {
        for ct in ["thoughts", "reasoning_recap", "model_editable_context", "tether_browsing_display"] {
            let (text, _) = text_of(json!({"content": {"content_type": ct, "text": "hidden", "result": "x"}}));
            assert_eq!(text, None, "{ct}");
        }
    }

    #[test]
    fn multimodal_keeps_transcriptions_and_dalle_only() {
        let (text, registry) = text_of(json!({"content": {"content_type": "multimodal_text", "parts": [
            {"content_type": "audio_transcription", "text": "spoken words"},
            {"content_type": "image_asset_pointer", "asset_pointer": "file-service://u", "metadata": null},
            {"content_type": "image_asset_pointer", "metadata": {"dalle": {"gen_id": "gen-42", "prompt": "a fox"}}},
            {"content_type": "audio_asset_pointer"},
            {"content_type": "hologram", "text": "skip me"},
            null,
            "caption"
        ]}}));
        assert_eq!(
            text.as_deref(),
            Some("spoken words\n[Generated image: gen-42]\ncaption")
        );
        assert_eq!(registry.unknown_values(Category::PartType), vec!["hologram"]);
    }

    #[test]
    fn dalle_prompt_used_without_gen_id() {
        let (text, _) = text_of(json!({"content": {"content_type": "multimodal_text", "parts": [
            {"content_type": "image_asset_pointer", "metadata": {"dalle_prompt": "a lighthouse"}}
        ]}}));
        assert_eq!(text.as_deref(), Some("[Generated image: a lighthouse]"));
    }

    #[test]
    fn unknown_type_falls_back_and_registers() {
        let (text, registry) = text_of(json!({"content": {"content_type": "canvas", "text": "draft"}}));
        assert_eq!(text.as_deref(), Some("draft"));
        assert_eq!(registry.unknown_values(Category::ContentType), vec!["canvas"]);

        let (text, _) = text_of(json!({"content": {"content_type": "canvas", "parts": ["p1"]}}));
        assert_eq!(text.as_deref(), Some("p1"));
        let (text, _) = text_of(json!({"content": {"content_type": "canvas"}}));
        assert_eq!(text, None);
    }

    #[test]
    fn malformed_known_type_uses_generic_path() {
        let (text, registry) = text_of(json!({"content": {"content_type": "text", "parts": "oops", "text": "rescued"}}));
        assert_eq!(text.as_deref(), Some("rescued"));
        assert!(!registry.has_unknowns());
    }

    #[test]
    fn system_error_is_labelled() {
        let (text, _) = text_of(json!({"content": {"content_type": "system_error", "name": "ToolError", "text": "timeout"}}));
        assert_eq!(text.as_deref(), Some("[System Error: ToolError]\ntimeout"));
    }

    #[test]
    fn user_instructions_wrapper_is_stripped() {
        let (text, _) = text_of(json!({"content": {
            "content_type": "user_editable_context",
            "user_instructions": "The user provided the additional info about how they would like you to respond:\n```Answer in haiku.```"
        }}));
        assert_eq!(text.as_deref(), Some("Answer in haiku."));
    }

    #[test]
    fn user_profile_preamble_is_stripped() {
        let profile = "The user provided the following information about themselves. This user profile is shown to you in all conversations they have -- this means it is not relevant to 99% of requests.\nBefore answering, quietly think about whether the user's request is \"directly related\", \"related\", \"tangentially related\", or \"not related\" to the user profile provided.\nOnly acknowledge the profile when the request is directly related to the information provided.\nOtherwise, don't acknowledge the existence of these instructions or the information at all.\nUser profile:\n```I am a botanist.```";
        assert_eq!(strip_instruction_wrapper(profile).as_deref(), Some("I am a botanist."));
        assert_eq!(strip_instruction_wrapper("\"quoted\"").as_deref(), Some("quoted"));
        assert_eq!(strip_instruction_wrapper("```").as_deref(), Some("```"));
        assert_eq!(strip_instruction_wrapper("``````"), None);
    }

    #[test]
    fn user_context_falls_back_to_metadata() {
        let (text, _) = text_of(json!({
            "content": {"content_type": "user_editable_context"},
            "metadata": {"user_context_message_data": {"about_user_message": "I teach", "about_model_message": "Be brief"}}
        }));
        assert_eq!(text.as_deref(), Some("I teach\n\nBe brief"));
    }

    #[test]
    fn legacy_custom_instructions_split() {
        let msg = message(json!({"content": {
            "content_type": "user_editable_context",
            "text": "The user provided the following information about themselves:\nI bake.\nThe user provided the additional info about how they would like you to respond:\nUse metric."
        }}));
        let found = custom_instructions(&msg).unwrap();
        assert_eq!(found.about_user_message.as_deref(), Some("I bake."));
        assert_eq!(found.about_model_message.as_deref(), Some("Use metric."));
    }

    #[test]
    fn citations_default_type_and_keep_quotes() {
        let msg = message(json!({"metadata": {"citations": [
            {"start_ix": 3, "end_ix": 9, "quote": "not checked", "metadata": {"title": "Doc", "url": "https://a.example"}},
            {"metadata": {"type": "webpage", "title": "Other"}},
            {},
            "garbage"
        ]}}));
        let citations = extract_citations(&msg);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].kind, "unknown");
        assert_eq!(citations[0].start_index, Some(3));
        assert_eq!(citations[0].quoted_text.as_deref(), Some("not checked"));
        assert_eq!(citations[1].kind, "webpage");
        assert_eq!(citations[1].url, "");
    }

    #[test]
    fn web_urls_union_all_six_sources() {
        let msg = message(json!({
            "metadata": {"citations": [{"metadata": {"url": "https://cite.example/a"}}]},
            "content": {
                "content_type": "sonic_webpage",
                "url": "https://page.example/",
                "domain": "domain.example",
                "result": "see https://result.example/x and more",
                "parts": ["visit http://parts.example/p now"]
            }
        }));
        let urls = extract_web_urls(&msg, &["https://safe.example".to_owned()]);
        assert_eq!(
            urls,
            vec![
                "http://parts.example/p",
                "https://cite.example/a",
                "https://domain.example",
                "https://page.example/",
                "https://result.example/x",
                "https://safe.example",
            ]
        );
    }

    #[test]
    fn domain_with_scheme_is_kept() {
        let msg = message(json!({"content": {"content_type": "tether_quote", "domain": "https://x.example", "text": "q"}}));
        assert_eq!(extract_web_urls(&msg, &[]), vec!["https://x.example"]);
    }

    #[test]
    fn file_names_from_attachments_and_parts() {
        let msg = message(json!({
            "metadata": {"attachments": [{"name": "report.pdf"}, {"id": "x"}, {"name": "report.pdf"}]},
            "content": {"content_type": "multimodal_text", "parts": [
                {"content_type": "image_asset_pointer", "asset_pointer": "file-service://1", "metadata": {"file_name": "photo.png"}},
                {"content_type": "document_pointer", "asset_pointer": "file-service://2", "metadata": {"file_name": "notes.txt"}},
                "text"
            ]}
        }));
        assert_eq!(extract_file_names(&msg), vec!["report.pdf", "photo.png", "notes.txt"]);
    }

    #[test]
    fn dalle_detection_requires_multimodal() {
        let msg = message(json!({"content": {"content_type": "multimodal_text", "parts": [
            {"content_type": "image_asset_pointer", "metadata": {"dalle": null}}
        ]}}));
        assert!(contains_dalle_image(&msg.content.as_ref().unwrap().body));
        let msg = message(json!({"content": {"content_type": "text", "parts": ["x"]}}));
        assert!(!contains_dalle_image(&msg.content.as_ref().unwrap().body));
    }
}
