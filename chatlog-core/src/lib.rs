//! Turns ChatGPT `conversations.json` exports into linear transcripts.
//!
//! Each exported conversation is a tree of message nodes. The active branch is
//! walked from its leaf back to the root ([`traverse`]), filtered
//! ([`filter`]), converted to text ([`extract`]) and stitched into a
//! [`Conversation`]. A broken record yields an [`ExtractionFailure`] and the
//! batch carries on.

pub mod config;
pub mod conversation;
pub mod error;
pub mod extract;
pub mod failure;
pub mod filter;
pub mod output;
pub mod pipeline;
pub mod raw;
pub mod render;
pub mod schema;
pub mod stream;
pub mod traverse;

pub use config::ChatlogConfig;
pub use conversation::{Citation, Conversation, CustomInstructions, Message, Role};
pub use error::{ChatlogError, Result};
pub use extract::ContentExtractor;
pub use failure::{ExtractionFailure, FailureCategory, StructuralStats};
pub use filter::{merge_continuations, MessageFilter};
pub use output::{write_outcome, JsonMode, OutputFormat, OutputOptions, WriteSummary};
pub use pipeline::{run_batch, BatchObserver, BatchOptions, BatchOutcome, ConversationPipeline};
pub use raw::{RawConversation, RawMessage, RawNode};
pub use render::{render_json, render_markdown};
pub use schema::{Category, SchemaRegistry, SchemaReport};
pub use stream::{load_export, ExportStream};
pub use traverse::{effective_weight, forward_traverse, traverse};
