//! Schema evolution tracking.
//!
//! The export format keeps growing new content types, roles and metadata
//! fields. Nothing here changes how a conversation is processed: the registry
//! only records values outside a fixed baseline so the batch can end with a
//! report of what the extractor has not been taught yet.
//!
//! One registry lives for one batch run. Parallel workers each fill their own
//! and [`SchemaRegistry::merge`] folds them together; the result does not
//! depend on merge order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::raw::RawMessage;

/// How many conversation ids are kept per unknown value.
pub const SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ContentType,
    Role,
    Recipient,
    MetadataKey,
    PartType,
    FinishType,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::ContentType,
        Category::Role,
        Category::PartType,
        Category::Recipient,
        Category::FinishType,
        Category::MetadataKey,
    ];

    /// Values the extractor already understands.
    pub fn baseline(&self) -> &'static [&'static str] {
        match self {
            Category::ContentType => &[
                "text",
                "code",
                "multimodal_text",
                "execution_output",
                "tether_quote",
                "tether_browsing_display",
                "user_editable_context",
                "model_editable_context",
                "thoughts",
                "reasoning_recap",
                "sonic_webpage",
                "system_error",
            ],
            Category::Role => &["system", "user", "assistant", "tool"],
            Category::Recipient => &[
                "all",
                "assistant",
                "bio",
                "browser",
                "canmore.create_textdoc",
                "canmore.update_textdoc",
                "dalle.text2im",
                "file_search",
                "myfiles_browser",
                "python",
                "web",
                "web.run",
            ],
            Category::MetadataKey => &[
                "aggregate_result",
                "attachments",
                "citations",
                "command",
                "content_references",
                "default_model_slug",
                "finish_details",
                "is_complete",
                "is_user_system_message",
                "is_visually_hidden_from_conversation",
                "message_type",
                "model_slug",
                "parent_id",
                "rebase_system_message",
                "request_id",
                "safe_urls",
                "search_result_groups",
                "serialization_metadata",
                "status",
                "timestamp_",
                "user_context_message_data",
                "voice_mode_message",
            ],
            Category::PartType => &[
                "image_asset_pointer",
                "audio_transcription",
                "audio_asset_pointer",
                "video_asset_pointer",
                "real_time_user_audio_video_asset_pointer",
                "code_interpreter_output",
            ],
            Category::FinishType => &["stop", "max_tokens", "interrupted"],
        }
    }

    pub fn is_known(&self, value: &str) -> bool {
        self.baseline().contains(&value)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::ContentType => "Content Types",
            Category::Role => "Author Roles",
            Category::Recipient => "Recipients",
            Category::MetadataKey => "Metadata Keys",
            Category::PartType => "Part Types",
            Category::FinishType => "Finish Types",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Sighting {
    count: u64,
    conversations: BTreeSet<String>,
}

/// Accumulates every observed value, flagging those outside the baseline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaRegistry {
    seen: BTreeMap<Category, BTreeMap<String, u64>>,
    unknown: BTreeMap<Category, BTreeMap<String, Sighting>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, category: Category, value: &str, conversation_id: &str) {
        if value.is_empty() {
            return;
        }
        *self
            .seen
            .entry(category)
            .or_default()
            .entry(value.to_owned())
            .or_default() += 1;

        if category.is_known(value) {
            return;
        }
        let sighting = self
            .unknown
            .entry(category)
            .or_default()
            .entry(value.to_owned())
            .or_default();
        sighting.count += 1;
        record_sample(&mut sighting.conversations, conversation_id);
    }

    /// Role, recipient, metadata keys and finish type of one message.
    pub fn observe_message(&mut self, message: &RawMessage, conversation_id: &str) {
        if let Some(role) = message.author.role.as_deref() {
            self.observe(Category::Role, role, conversation_id);
        }
        if let Some(recipient) = message.recipient.as_deref() {
            self.observe(Category::Recipient, recipient, conversation_id);
        }
        if let Some(metadata) = &message.metadata {
            for key in metadata.keys() {
                self.observe(Category::MetadataKey, key, conversation_id);
            }
            if let Some(finish) = metadata
                .get("finish_details")
                .and_then(|d| d.get("type"))
                .and_then(Value::as_str)
            {
                self.observe(Category::FinishType, finish, conversation_id);
            }
        }
    }

    pub fn merge(&mut self, other: SchemaRegistry) {
        for (category, values) in other.seen {
            let into = self.seen.entry(category).or_default();
            for (value, count) in values {
                *into.entry(value).or_default() += count;
            }
        }
        for (category, values) in other.unknown {
            let into = self.unknown.entry(category).or_default();
            for (value, sighting) in values {
                let slot = into.entry(value).or_default();
                slot.count += sighting.count;
                for conversation_id in sighting.conversations {
                    record_sample(&mut slot.conversations, &conversation_id);
                }
            }
        }
    }

    pub fn has_unknowns(&self) -> bool {
        self.unknown.values().any(|values| !values.is_empty())
    }

    pub fn unknown_values(&self, category: Category) -> Vec<&str> {
        self.unknown
            .get(&category)
            .map(|values| values.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn report(&self) -> SchemaReport {
        let categories = Category::ALL
            .iter()
            .map(|category| {
                let seen = self.seen.get(category);
                let known_seen = seen
                    .map(|values| values.keys().filter(|v| category.is_known(v)).count())
                    .unwrap_or(0);
                let unknown = self
                    .unknown
                    .get(category)
                    .map(|values| {
                        values
                            .iter()
                            .map(|(value, sighting)| UnknownValue {
                                value: value.clone(),
                                occurrences: sighting.count,
                                sample_conversations: sighting.conversations.iter().cloned().collect(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                CategoryReport {
                    category: *category,
                    distinct_seen: seen.map(BTreeMap::len).unwrap_or(0),
                    known_seen,
                    unknown,
                }
            })
            .collect();
        SchemaReport { categories }
    }
}

/// Keeps the lexicographically smallest ids so the sample is order-independent.
fn record_sample(samples: &mut BTreeSet<String>, conversation_id: &str) {
    samples.insert(conversation_id.to_owned());
    while samples.len() > SAMPLE_LIMIT {
        samples.pop_last();
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchemaReport {
    pub categories: Vec<CategoryReport>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryReport {
    pub category: Category,
    pub distinct_seen: usize,
    pub known_seen: usize,
    pub unknown: Vec<UnknownValue>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnknownValue {
    pub value: String,
    pub occurrences: u64,
    pub sample_conversations: Vec<String>,
}

impl SchemaReport {
    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }
}

impl fmt::Display for SchemaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.categories {
            writeln!(f, "## {}", report.category.label())?;
            writeln!(f, "  Distinct values seen: {}", report.distinct_seen)?;
            writeln!(f, "  Known: {}", report.known_seen)?;
            writeln!(f, "  Unknown: {}", report.unknown.len())?;
            for unknown in &report.unknown {
                writeln!(f, "    - {} (x{})", unknown.value, unknown.occurrences)?;
                for id in unknown.sample_conversations.iter().take(3) {
                    writeln!(f, "        seen in {}", id)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
