//! Which messages make it into a transcript, and how split assistant replies
//! are stitched back together.

use std::fmt;

use crate::conversation::{Message, Role};
use crate::extract::contains_dalle_image;
use crate::raw::{AuthorRole, RawMessage};

const REASONING_TYPES: &[&str] = &["model_editable_context", "thoughts", "reasoning_recap"];

/// Why a message was left out of the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Hidden,
    ToolInternal,
    SystemPrompt,
    Reasoning,
    UnknownRole,
    EmptyAssistant,
    DuplicateSystem,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Exclusion::Hidden => "visually hidden",
            Exclusion::ToolInternal => "tool output",
            Exclusion::SystemPrompt => "system prompt",
            Exclusion::Reasoning => "reasoning trace",
            Exclusion::UnknownRole => "unrecognized author role",
            Exclusion::EmptyAssistant => "empty assistant placeholder",
            Exclusion::DuplicateSystem => "second system message",
        })
    }
}

/// Inclusion rules that only need the raw message, checked in order.
pub fn exclusion(message: &RawMessage) -> Option<Exclusion> {
    if message.is_visually_hidden() {
        return Some(Exclusion::Hidden);
    }
    match message.role() {
        AuthorRole::Tool => {
            let dalle = message
                .content
                .as_ref()
                .is_some_and(|c| contains_dalle_image(&c.body));
            if !dalle {
                return Some(Exclusion::ToolInternal);
            }
        }
        AuthorRole::System => {
            let qualifies = message.is_user_system_message()
                || message.content_type() == Some("user_editable_context");
            if !qualifies {
                return Some(Exclusion::SystemPrompt);
            }
        }
        AuthorRole::Other(_) | AuthorRole::Missing => return Some(Exclusion::UnknownRole),
        AuthorRole::User | AuthorRole::Assistant => {}
    }
    match message.content_type() {
        Some(kind) if REASONING_TYPES.contains(&kind) => Some(Exclusion::Reasoning),
        _ => None,
    }
}

pub fn should_include(message: &RawMessage) -> bool {
    exclusion(message).is_none()
}

/// Per-conversation filter state.
///
/// Rules that depend on extracted text, and the one-system-message cap, need
/// to see messages in path order, so a fresh filter is used per conversation.
#[derive(Debug, Default)]
pub struct MessageFilter {
    system_emitted: bool,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-extraction check.
    pub fn check(&self, message: &RawMessage) -> Result<(), Exclusion> {
        if let Some(reason) = exclusion(message) {
            return Err(reason);
        }
        if self.system_emitted && message.role() == AuthorRole::System {
            return Err(Exclusion::DuplicateSystem);
        }
        Ok(())
    }

    pub fn should_include(&self, message: &RawMessage) -> bool {
        self.check(message).is_ok()
    }

    /// Post-extraction check. Accepting a system message closes the gate for
    /// any later one.
    pub fn accept(&mut self, raw: &RawMessage, message: &Message) -> Result<(), Exclusion> {
        match message.role {
            Role::Assistant => {
                let placeholder = raw
                    .content
                    .as_ref()
                    .is_some_and(|c| c.body.parts().is_empty_placeholder());
                if placeholder || message.text.trim().is_empty() {
                    return Err(Exclusion::EmptyAssistant);
                }
            }
            Role::System => {
                if self.system_emitted {
                    return Err(Exclusion::DuplicateSystem);
                }
                if message.text.trim().is_empty() {
                    return Err(Exclusion::SystemPrompt);
                }
                self.system_emitted = true;
            }
            Role::User => {}
        }
        Ok(())
    }
}

fn mergeable(prev: &Message, tail_index: usize, next: &Message) -> bool {
    prev.role == Role::Assistant
        && next.role == Role::Assistant
        && prev.is_user_facing()
        && next.is_user_facing()
        && next.graph_index == tail_index + 1
}

fn absorb(into: &mut Message, next: Message) {
    if into.text.is_empty() {
        into.text = next.text;
    } else if !next.text.is_empty() {
        into.text.push_str("\n\n");
        into.text.push_str(&next.text);
    }
    for citation in next.citations {
        if !into.citations.contains(&citation) {
            into.citations.push(citation);
        }
    }
    into.web_urls.extend(next.web_urls);
    into.web_urls.sort();
    into.web_urls.dedup();
    for file in next.files {
        if !into.files.contains(&file) {
            into.files.push(file);
        }
    }
}

/// Joins runs of user-facing assistant messages that were adjacent on the
/// traversed path. Adjacency is judged against the last message absorbed,
/// so a run of three merges into one.
pub fn merge_continuations(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    let mut tail_index = 0;

    for message in messages {
        if let Some(prev) = merged.last_mut() {
            if mergeable(prev, tail_index, &message) {
                tail_index = message.graph_index;
                absorb(prev, message);
                continue;
            }
        }
        tail_index = message.graph_index;
        merged.push(message);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Citation;
    use serde_json::{json, Value};

    fn raw(value: Value) -> RawMessage {
        serde_json::from_value(value).unwrap()
    }

    fn assistant(text: &str, graph_index: usize) -> Message {
        Message::new(Role::Assistant, text, graph_index)
    }

    #[test]
    fn hidden_messages_are_dropped_first() {
        let msg = raw(json!({
            "author": {"role": "user"},
            "metadata": {"is_visually_hidden_from_conversation": true}
        }));
        assert_eq!(exclusion(&msg), Some(Exclusion::Hidden));
    }

    #[test]
    fn tool_messages_need_a_dalle_image() {
        let plain = raw(json!({"author": {"role": "tool"}, "content": {"content_type": "execution_output", "text": "1"}}));
        assert_eq!(exclusion(&plain), Some(Exclusion::ToolInternal));

        let dalle = raw(json!({"author": {"role": "tool"}, "content": {"content_type": "multimodal_text", "parts": [
            {"content_type": "image_asset_pointer", "metadata": {"dalle": {"gen_id": "g1"}}}
        ]}}));
        assert!(should_include(&dalle));
    }

    #[test]
    fn system_messages_need_a_user_marker() {
        let plain = raw(json!({"author": {"role": "system"}, "content": {"content_type": "text", "parts": ["You are"]}}));
        assert_eq!(exclusion(&plain), Some(Exclusion::SystemPrompt));

        let flagged = raw(json!({"author": {"role": "system"}, "metadata": {"is_user_system_message": true}}));
        assert!(should_include(&flagged));

        let context = raw(json!({"author": {"role": "system"}, "content": {"content_type": "user_editable_context"}}));
        assert!(should_include(&context));
    }

    #[test]
    fn reasoning_and_unknown_roles_are_dropped() {
        let thoughts = raw(json!({"author": {"role": "assistant"}, "content": {"content_type": "thoughts"}}));
        assert_eq!(exclusion(&thoughts), Some(Exclusion::Reasoning));
        let critic = raw(json!({"author": {"role": "critic"}}));
        assert_eq!(exclusion(&critic), Some(Exclusion::UnknownRole));
        let nobody = raw(json!({"content": {"content_type": "text", "parts": ["x"]}}));
        assert_eq!(exclusion(&nobody), Some(Exclusion::UnknownRole));
    }

    #[test]
    fn only_one_system_message_is_accepted() {
        let mut filter = MessageFilter::new();
        let raw_sys = raw(json!({"author": {"role": "system"}, "metadata": {"is_user_system_message": true}}));
        let sys = Message::new(Role::System, "Be terse", 0);

        assert!(filter.should_include(&raw_sys));
        assert_eq!(filter.accept(&raw_sys, &sys), Ok(()));
        assert_eq!(filter.check(&raw_sys), Err(Exclusion::DuplicateSystem));
        assert_eq!(filter.accept(&raw_sys, &sys), Err(Exclusion::DuplicateSystem));
    }

    #[test]
    fn empty_system_message_does_not_use_up_the_slot() {
        let mut filter = MessageFilter::new();
        let raw_sys = raw(json!({"author": {"role": "system"}, "metadata": {"is_user_system_message": true}}));
        assert!(filter.accept(&raw_sys, &Message::new(Role::System, "", 0)).is_err());
        assert!(filter.accept(&raw_sys, &Message::new(Role::System, "real", 1)).is_ok());
    }

    #[test]
    fn empty_assistant_placeholder_rejected() {
        let mut filter = MessageFilter::new();
        let placeholder = raw(json!({"author": {"role": "assistant"}, "content": {"content_type": "text", "parts": [""]}}));
        assert_eq!(
            filter.accept(&placeholder, &assistant("", 3)),
            Err(Exclusion::EmptyAssistant)
        );
        let user = raw(json!({"author": {"role": "user"}}));
        assert!(filter.accept(&user, &Message::new(Role::User, "", 4)).is_ok());
    }

    #[test]
    fn adjacent_assistant_chain_merges() {
        let mut first = assistant("one", 2);
        first.web_urls = vec!["https://b.example".into()];
        first.citations = vec![Citation {
            kind: "webpage".into(),
            title: "A".into(),
            url: "https://a.example".into(),
            quoted_text: None,
            start_index: None,
            end_index: None,
        }];
        let mut second = assistant("two", 3);
        second.web_urls = vec!["https://a.example".into(), "https://b.example".into()];
        second.citations = first.citations.clone();
        let third = assistant("three", 4);

        let merged = merge_continuations(vec![Message::new(Role::User, "q", 1), first, second, third]);
        assert_eq!(merged.len(), 2);
        let reply = &merged[1];
        assert_eq!(reply.text, "one\n\ntwo\n\nthree");
        assert_eq!(reply.graph_index, 2);
        assert_eq!(reply.citations.len(), 1);
        assert_eq!(reply.web_urls, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn gaps_and_tool_recipients_block_merging() {
        let gap = vec![assistant("a", 1), assistant("b", 3)];
        assert_eq!(merge_continuations(gap.clone()), gap);

        let mut to_tool = assistant("search(...)", 2);
        to_tool.recipient = Some("browser".into());
        let routed = vec![assistant("a", 1), to_tool, assistant("c", 3)];
        assert_eq!(merge_continuations(routed.clone()), routed);
    }

    #[test]
    fn role_change_blocks_merging() {
        let list = vec![
            assistant("a", 0),
            Message::new(Role::User, "b", 1),
            assistant("c", 2),
        ];
        assert_eq!(merge_continuations(list.clone()), list);
    }
}
