//! Per-conversation orchestration and the batch driver.
//!
//! [`ConversationPipeline::process`] turns one exported record into a
//! [`Conversation`] or an [`ExtractionFailure`]; it never aborts the caller.
//! [`run_batch`] drives it over a whole export, sequentially or on a rayon
//! pool, and stops before the next conversation once cancellation is flagged.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::conversation::{
    chat_url, from_unix_seconds, Conversation, Message, Role, DEFAULT_TITLE,
};
use crate::error::Result;
use crate::extract::{
    custom_instructions, extract_citations, extract_file_names, extract_web_urls, ContentExtractor,
};
use crate::failure::{ExtractionFailure, FailureCategory};
use crate::filter::{merge_continuations, MessageFilter};
use crate::raw::{AuthorRole, Part, RawContent, RawConversation, RawMessage};
use crate::schema::SchemaRegistry;
use crate::traverse::{resolve_start, traverse};

pub const UNKNOWN_ID: &str = "unknown";
pub const PROJECT_PREFIX: &str = "g-p-";
const PROJECT_SCOPES: &[&str] = &["project_only", "project_enabled"];

/// Project grouping key, if the conversation belongs to one.
pub fn project_id(raw: &RawConversation) -> Option<String> {
    let template = raw
        .conversation_template_id
        .as_deref()
        .filter(|t| !t.is_empty())?;
    let scoped = raw
        .memory_scope
        .as_deref()
        .is_some_and(|scope| PROJECT_SCOPES.contains(&scope));
    (template.starts_with(PROJECT_PREFIX) || scoped).then(|| template.to_owned())
}

/// Why [`ConversationPipeline::normalize`] gave up on a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub category: FailureCategory,
    pub reason: String,
}

impl Rejection {
    fn new(category: FailureCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }
}

pub struct ConversationPipeline<'a> {
    registry: &'a mut SchemaRegistry,
}

impl<'a> ConversationPipeline<'a> {
    pub fn new(registry: &'a mut SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Decodes and normalizes one exported record.
    ///
    /// Every way this can go wrong, a panic in a sub-step included, comes
    /// back as an `Err` carrying structural statistics of the record.
    pub fn process(&mut self, record: &Value) -> std::result::Result<Conversation, ExtractionFailure> {
        let registry = &mut *self.registry;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let raw = decode(record)?;
            ConversationPipeline::new(registry).normalize(&raw)
        }));

        let rejection = match outcome {
            Ok(Ok(conversation)) => {
                debug!(
                    conv_id = %conversation.id,
                    messages = conversation.messages.len(),
                    "conversation extracted"
                );
                return Ok(conversation);
            }
            Ok(Err(rejection)) => rejection,
            Err(payload) => Rejection::new(FailureCategory::Internal, panic_message(payload.as_ref())),
        };

        let (id, title) = salvage_identity(record);
        let failure = ExtractionFailure::new(record, &id, &title, rejection.category, rejection.reason);
        warn!(
            conv_id = %failure.conversation_id,
            title = %failure.title,
            category = %failure.category,
            message = %failure.message,
            "conversation extraction failed"
        );
        Err(failure)
    }

    /// Builds the linear transcript of an already decoded conversation.
    pub fn normalize(&mut self, raw: &RawConversation) -> std::result::Result<Conversation, Rejection> {
        let id = raw.best_id().unwrap_or(UNKNOWN_ID).to_owned();
        let title = raw
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_TITLE)
            .to_owned();

        let Some(mapping) = &raw.mapping else {
            return Err(Rejection::new(
                FailureCategory::MissingMapping,
                "conversation has no mapping",
            ));
        };

        let current = raw.current_node.as_deref();
        let path = traverse(mapping, current);
        if path.is_empty() {
            let reason = if resolve_start(mapping, current).is_none() {
                "no usable start node: current_node missing or invalid and no leaf nodes"
            } else {
                "active path holds no messages"
            };
            return Err(Rejection::new(FailureCategory::Structural, reason));
        }
        debug!(conv_id = %id, path_len = path.len(), "traversed active path");

        let mut filter = MessageFilter::new();
        let mut messages = Vec::with_capacity(path.len());
        let mut content_types = BTreeSet::new();
        let mut code_messages = 0;
        let mut instructions = None;

        for step in &path {
            let raw_msg = step.message;
            self.registry.observe_message(raw_msg, &id);
            if let Some(kind) = raw_msg.content_type().filter(|k| !k.is_empty()) {
                content_types.insert(kind.to_owned());
            }
            if is_code_message(raw_msg) {
                code_messages += 1;
            }
            if instructions.is_none() {
                instructions = custom_instructions(raw_msg);
            }

            if let Err(reason) = filter.check(raw_msg) {
                debug!(conv_id = %id, node = step.node_id, %reason, "message excluded");
                continue;
            }
            let Some(role) = transcript_role(&raw_msg.role()) else {
                continue;
            };
            let text = ContentExtractor::new(&mut *self.registry, &id).extract_text(raw_msg);

            let mut message = Message::new(role, text.unwrap_or_default(), step.graph_index);
            message.citations = extract_citations(raw_msg);
            message.web_urls = extract_web_urls(raw_msg, &raw.safe_urls);
            message.files = extract_file_names(raw_msg);
            message.timestamp = raw_msg.create_time.and_then(from_unix_seconds);
            message.recipient = raw_msg.recipient.clone();

            if let Err(reason) = filter.accept(raw_msg, &message) {
                debug!(conv_id = %id, node = step.node_id, %reason, "message excluded");
                continue;
            }
            messages.push(message);
        }

        let messages = merge_continuations(messages);
        if messages.is_empty() {
            return Err(Rejection::new(
                FailureCategory::Structural,
                "no displayable messages on the active path",
            ));
        }

        Ok(Conversation {
            chat_url: chat_url(&id),
            id,
            title,
            create_time: raw.create_time.and_then(from_unix_seconds),
            update_time: raw.update_time.and_then(from_unix_seconds),
            project_id: project_id(raw),
            model: raw.default_model_slug.clone(),
            starred: raw.is_starred.unwrap_or(false),
            archived: raw.is_archived.unwrap_or(false),
            content_types: content_types.into_iter().collect(),
            code_messages,
            custom_instructions: instructions,
            messages,
        })
    }
}

fn decode(record: &Value) -> std::result::Result<RawConversation, Rejection> {
    if !record.is_object() {
        return Err(Rejection::new(
            FailureCategory::Decode,
            format!("record is {}, expected an object", kind_of(record)),
        ));
    }
    RawConversation::deserialize(record)
        .map_err(|err| Rejection::new(FailureCategory::Decode, err.to_string()))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Id and title read straight from the JSON, for records that did not decode.
fn salvage_identity(record: &Value) -> (String, String) {
    let text = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    };
    let id = text("id").or_else(|| text("conversation_id")).unwrap_or(UNKNOWN_ID);
    let title = text("title").unwrap_or(DEFAULT_TITLE);
    (id.to_owned(), title.to_owned())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic during extraction: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic during extraction: {msg}")
    } else {
        "panic during extraction".to_owned()
    }
}

/// Tool messages only get this far when they carry a generated image.
fn transcript_role(role: &AuthorRole) -> Option<Role> {
    match role {
        AuthorRole::User => Some(Role::User),
        AuthorRole::Assistant | AuthorRole::Tool => Some(Role::Assistant),
        AuthorRole::System => Some(Role::System),
        AuthorRole::Other(_) | AuthorRole::Missing => None,
    }
}

fn is_code_message(message: &RawMessage) -> bool {
    match message.content.as_ref().map(|c| &c.body) {
        Some(RawContent::Code { .. } | RawContent::ExecutionOutput { .. }) => true,
        Some(RawContent::MultimodalText { parts }) => parts
            .items()
            .iter()
            .any(|part| matches!(part, Part::CodeInterpreterOutput { .. })),
        _ => false,
    }
}

/// Receives one event per finished conversation. Called from worker threads
/// when the batch runs in parallel.
pub trait BatchObserver: Sync {
    fn on_success(&self, _conversation: &Conversation) {}
    fn on_failure(&self, _failure: &ExtractionFailure) {}
}

/// Observer that ignores everything.
pub struct Silent;

impl BatchObserver for Silent {}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Worker threads; `1` runs inline, `0` picks from the CPU count.
    pub jobs: usize,
    pub cancel: Arc<AtomicBool>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl BatchOptions {
    pub fn workers(&self) -> usize {
        match self.jobs {
            0 => num_cpus::get().min(8),
            n => n,
        }
    }
}

/// Everything a batch produced, in input order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub conversations: Vec<Conversation>,
    pub failures: Vec<ExtractionFailure>,
    pub registry: SchemaRegistry,
    pub total: usize,
    /// Records never started because the batch was cancelled.
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn processed(&self) -> usize {
        self.conversations.len() + self.failures.len()
    }

    pub fn cancelled(&self) -> bool {
        self.skipped > 0
    }
}

type Extracted = std::result::Result<Conversation, ExtractionFailure>;

/// Results of one worker, merged pairwise at the end.
#[derive(Default)]
struct Partial {
    registry: SchemaRegistry,
    results: Vec<(usize, Extracted)>,
    skipped: usize,
}

impl Partial {
    fn step(
        mut self,
        index: usize,
        record: Value,
        cancel: &AtomicBool,
        observer: &dyn BatchObserver,
    ) -> Self {
        if cancel.load(Ordering::Relaxed) {
            self.skipped += 1;
            return self;
        }
        let result = ConversationPipeline::new(&mut self.registry).process(&record);
        match &result {
            Ok(conversation) => observer.on_success(conversation),
            Err(failure) => observer.on_failure(failure),
        }
        self.results.push((index, result));
        self
    }

    fn combine(mut self, other: Partial) -> Self {
        self.registry.merge(other.registry);
        self.results.extend(other.results);
        self.skipped += other.skipped;
        self
    }

    fn finish(mut self, total: usize) -> BatchOutcome {
        self.results.sort_by_key(|(index, _)| *index);
        let mut outcome = BatchOutcome {
            registry: self.registry,
            total,
            skipped: self.skipped,
            ..Default::default()
        };
        for (_, result) in self.results {
            match result {
                Ok(conversation) => outcome.conversations.push(conversation),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome
    }
}

/// Runs the pipeline over every record of an export.
///
/// Only a worker pool that cannot be built is an error; per-conversation
/// problems end up in [`BatchOutcome::failures`].
#[instrument(skip_all, fields(total = records.len()))]
pub fn run_batch(
    records: Vec<Value>,
    options: &BatchOptions,
    observer: &dyn BatchObserver,
) -> Result<BatchOutcome> {
    let total = records.len();
    let workers = options.workers();
    let cancel = options.cancel.as_ref();

    let partial = if workers <= 1 {
        records
            .into_iter()
            .enumerate()
            .fold(Partial::default(), |acc, (index, record)| {
                acc.step(index, record, cancel, observer)
            })
    } else {
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?
            .install(|| {
                records
                    .into_par_iter()
                    .enumerate()
                    .fold(Partial::default, |acc, (index, record)| {
                        acc.step(index, record, cancel, observer)
                    })
                    .reduce(Partial::default, Partial::combine)
            })
    };

    let outcome = partial.finish(total);
    if outcome.cancelled() {
        warn!(
            processed = outcome.processed(),
            skipped = outcome.skipped,
            "batch cancelled before all conversations were processed"
        );
    }
    info!(
        workers,
        succeeded = outcome.conversations.len(),
        failed = outcome.failures.len(),
        "batch complete"
    );
    Ok(outcome)
}
