//! Writes a finished batch to disk.
//!
//! Layout under the output directory:
//!
//! ```text
//! <out>/md/[<project>/]<title>.md
//! <out>/json/[<project>/]<title>.json            (multiple)
//! <out>/conversations_export_<stamp>.json         (single)
//! <out>/schema_evolution.log
//! <out>/conversion_log.log, conversion_failures.json   (only with failures)
//! ```
//!
//! A file that cannot be written is logged and counted; only failing to
//! create the output directories stops the run.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::conversation::Conversation;
use crate::error::{ChatlogError, Result};
use crate::failure::{ExtractionFailure, FailureCategory};
use crate::pipeline::BatchOutcome;
use crate::render::{render_json, render_markdown, ExportDocument, ExportMetadata};
use crate::schema::SchemaRegistry;

pub const MAX_FILENAME_LEN: usize = 100;
pub const SCHEMA_REPORT_FILE: &str = "schema_evolution.log";
pub const FAILURE_LOG_FILE: &str = "conversion_log.log";
pub const FAILURE_JSON_FILE: &str = "conversion_failures.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Json,
    #[default]
    Both,
}

impl OutputFormat {
    pub fn markdown(&self) -> bool {
        matches!(self, Self::Markdown | Self::Both)
    }

    pub fn json(&self) -> bool {
        matches!(self, Self::Json | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonMode {
    /// Every conversation in one export file.
    #[default]
    Single,
    /// One JSON file per conversation.
    Multiple,
}

#[derive(Debug, Clone)]
pub struct OutputOptions {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub json_mode: JsonMode,
    pub markdown_dir: Option<PathBuf>,
    pub json_dir: Option<PathBuf>,
    pub json_file: Option<PathBuf>,
    pub preserve_timestamps: bool,
    pub dry_run: bool,
    /// Recorded in the single-file export header.
    pub source_file: String,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("chatlog_out"),
            format: OutputFormat::default(),
            json_mode: JsonMode::default(),
            markdown_dir: None,
            json_dir: None,
            json_file: None,
            preserve_timestamps: true,
            dry_run: false,
            source_file: "conversations.json".to_owned(),
        }
    }
}

/// Where each kind of output goes; `None` when the format is off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub markdown_dir: Option<PathBuf>,
    pub json_dir: Option<PathBuf>,
    pub json_file: Option<PathBuf>,
}

impl OutputPaths {
    /// Overrides replace the default `md/` and `json/` subdirectories outright.
    pub fn resolve(options: &OutputOptions, stamp: &str) -> Self {
        let out = &options.output_dir;
        let markdown_dir = options
            .format
            .markdown()
            .then(|| options.markdown_dir.clone().unwrap_or_else(|| out.join("md")));
        let (json_dir, json_file) = match (options.format.json(), options.json_mode) {
            (false, _) => (None, None),
            (true, JsonMode::Multiple) => (
                Some(options.json_dir.clone().unwrap_or_else(|| out.join("json"))),
                None,
            ),
            (true, JsonMode::Single) => (
                None,
                Some(options.json_file.clone().unwrap_or_else(|| {
                    out.join(format!("conversations_export_{stamp}.json"))
                })),
            ),
        };
        Self {
            markdown_dir,
            json_dir,
            json_file,
        }
    }

    fn directories<'a>(&'a self, out: &'a Path) -> impl Iterator<Item = &'a Path> {
        let file_parent = self
            .json_file
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty());
        std::iter::once(out)
            .chain(self.markdown_dir.as_deref())
            .chain(self.json_dir.as_deref())
            .chain(file_parent)
    }
}

/// Turns a conversation title into a portable file stem.
pub fn sanitize_filename(title: &str, max_len: usize) -> String {
    let replaced: String = title
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    let mut stem: String = replaced.trim().chars().take(max_len).collect();
    let trimmed_len = stem.trim_end_matches(['.', ' ']).len();
    stem.truncate(trimmed_len);
    if stem.is_empty() {
        "untitled".to_owned()
    } else {
        stem
    }
}

/// Hands out unique paths: `name.ext`, then `name (2).ext`, `name (3).ext`, ...
///
/// A path is taken if it already exists on disk or was handed out earlier in
/// this run, so dry runs resolve the same names a real run would.
#[derive(Debug, Default)]
pub struct FileNamer {
    claimed: HashSet<PathBuf>,
}

impl FileNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, dir: &Path, stem: &str, ext: &str) -> PathBuf {
        let mut candidate = dir.join(format!("{stem}.{ext}"));
        let mut counter = 2;
        while self.claimed.contains(&candidate) || candidate.exists() {
            candidate = dir.join(format!("{stem} ({counter}).{ext}"));
            counter += 1;
        }
        self.claimed.insert(candidate.clone());
        candidate
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub markdown_written: usize,
    pub json_written: usize,
    pub write_failures: usize,
    pub timestamp_sync_failures: usize,
    pub json_file: Option<PathBuf>,
    pub reports: Vec<PathBuf>,
}

pub struct OutputWriter {
    options: OutputOptions,
    paths: OutputPaths,
    namer: FileNamer,
    summary: WriteSummary,
}

impl OutputWriter {
    /// Resolves paths and creates the output directories.
    pub fn create(options: OutputOptions) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let paths = OutputPaths::resolve(&options, &stamp);
        if !options.dry_run {
            for dir in paths.directories(&options.output_dir) {
                fs::create_dir_all(dir).map_err(|e| ChatlogError::output(dir, e))?;
            }
        }
        Ok(Self {
            options,
            paths,
            namer: FileNamer::new(),
            summary: WriteSummary::default(),
        })
    }

    pub fn paths(&self) -> &OutputPaths {
        &self.paths
    }

    /// Writes the per-conversation files of every format that has them.
    pub fn write_conversation(&mut self, conv: &Conversation) {
        if let Some(dir) = self.paths.markdown_dir.clone() {
            match render_markdown(conv) {
                Ok(md) => {
                    if self.write_file(conv, &dir, "md", md.as_bytes()) {
                        self.summary.markdown_written += 1;
                    }
                }
                Err(err) => self.record_write_failure(&conv.id, &dir, &err),
            }
        }
        if let Some(dir) = self.paths.json_dir.clone() {
            match render_json(conv) {
                Ok(json) => {
                    if self.write_file(conv, &dir, "json", json.as_bytes()) {
                        self.summary.json_written += 1;
                    }
                }
                Err(err) => self.record_write_failure(&conv.id, &dir, &err),
            }
        }
    }

    fn write_file(&mut self, conv: &Conversation, base: &Path, ext: &str, body: &[u8]) -> bool {
        let dir = match &conv.project_id {
            Some(project) => base.join(sanitize_filename(project, MAX_FILENAME_LEN)),
            None => base.to_path_buf(),
        };
        let stem = sanitize_filename(&conv.title, MAX_FILENAME_LEN);
        let path = self.namer.claim(&dir, &stem, ext);

        if self.options.dry_run {
            debug!(conv_id = %conv.id, path = %path.display(), "dry-run: skipping write");
            return true;
        }

        let written = fs::create_dir_all(&dir)
            .and_then(|_| fs::write(&path, body))
            .map_err(|e| ChatlogError::output(&path, e));
        if let Err(err) = written {
            self.record_write_failure(&conv.id, &path, &err);
            return false;
        }
        debug!(conv_id = %conv.id, path = %path.display(), "wrote transcript");

        if self.options.preserve_timestamps {
            if let Some(when) = conv.last_activity() {
                if let Err(err) = set_modified(&path, when) {
                    warn!(path = %path.display(), error = %err, "failed to sync file timestamp");
                    self.summary.timestamp_sync_failures += 1;
                }
            }
        }
        true
    }

    fn record_write_failure(&mut self, conv_id: &str, path: &Path, err: &ChatlogError) {
        warn!(conv_id = %conv_id, path = %path.display(), error = %err, "failed to write output");
        self.summary.write_failures += 1;
    }

    /// Writes the single-file export, when that mode is on.
    pub fn write_single_export(&mut self, conversations: &[Conversation], failed: usize) -> Result<()> {
        let Some(path) = self.paths.json_file.clone() else {
            return Ok(());
        };
        if conversations.is_empty() {
            debug!("no conversations for the single-file export");
            return Ok(());
        }
        let metadata = ExportMetadata::new(
            Utc::now(),
            conversations.len(),
            failed,
            self.options.source_file.clone(),
            self.options.preserve_timestamps,
        );
        let document = ExportDocument::new(metadata, conversations);
        let body = serde_json::to_string_pretty(&document)
            .map_err(|e| ChatlogError::json("single-file export", e))?;
        self.summary.json_written = conversations.len();
        self.summary.json_file = Some(path.clone());
        if self.options.dry_run {
            return Ok(());
        }
        fs::write(&path, body).map_err(|e| ChatlogError::output(&path, e))?;
        info!(path = %path.display(), conversations = conversations.len(), "wrote single-file export");
        Ok(())
    }

    /// Schema report, plus the failure log and its JSON twin when anything failed.
    pub fn write_reports(&mut self, registry: &SchemaRegistry, failures: &[ExtractionFailure]) -> Result<()> {
        let generated = Local::now();
        let out = self.options.output_dir.clone();

        let mut reports = vec![(out.join(SCHEMA_REPORT_FILE), schema_log(registry, generated))];
        if !failures.is_empty() {
            reports.push((out.join(FAILURE_LOG_FILE), failure_log(failures, generated)));
            let json = serde_json::to_string_pretty(failures)
                .map_err(|e| ChatlogError::json("failure report", e))?;
            reports.push((out.join(FAILURE_JSON_FILE), json));
        }

        for (path, body) in reports {
            if !self.options.dry_run {
                fs::write(&path, body).map_err(|e| ChatlogError::output(&path, e))?;
            }
            self.summary.reports.push(path);
        }
        Ok(())
    }

    pub fn finish(self) -> WriteSummary {
        self.summary
    }
}

/// Writes everything a batch produced: transcripts, single export, reports.
#[instrument(skip_all, fields(out = %options.output_dir.display()))]
pub fn write_outcome(outcome: &BatchOutcome, options: OutputOptions) -> Result<WriteSummary> {
    let mut writer = OutputWriter::create(options)?;
    for conv in &outcome.conversations {
        writer.write_conversation(conv);
    }
    writer.write_single_export(&outcome.conversations, outcome.failures.len())?;
    writer.write_reports(&outcome.registry, &outcome.failures)?;
    let summary = writer.finish();
    info!(
        markdown = summary.markdown_written,
        json = summary.json_written,
        write_failures = summary.write_failures,
        timestamp_sync_failures = summary.timestamp_sync_failures,
        "output written"
    );
    Ok(summary)
}

fn set_modified(path: &Path, when: DateTime<Utc>) -> std::io::Result<()> {
    let file = File::options().write(true).open(path)?;
    file.set_modified(SystemTime::from(when))
}

fn schema_log(registry: &SchemaRegistry, generated: DateTime<Local>) -> String {
    let mut log = String::new();
    let _ = writeln!(log, "Schema Evolution Report");
    let _ = writeln!(log, "Generated: {}", generated.to_rfc3339());
    let _ = writeln!(
        log,
        "Unknown values found: {}\n",
        if registry.has_unknowns() { "yes" } else { "no" }
    );
    let _ = write!(log, "{}", registry.report());
    log
}

const RULE: &str = "================================================================================";

fn failure_log(failures: &[ExtractionFailure], generated: DateTime<Local>) -> String {
    let mut log = String::new();
    let _ = writeln!(log, "{RULE}\nCONVERSATION EXTRACTION FAILURE LOG");
    let _ = writeln!(log, "Generated: {}", generated.to_rfc3339());
    let _ = writeln!(log, "Total Failures: {}\n{RULE}\n", failures.len());

    let mut categories: BTreeMap<FailureCategory, usize> = BTreeMap::new();
    for failure in failures {
        *categories.entry(failure.category).or_default() += 1;
    }
    let mut by_count: Vec<_> = categories.into_iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(&a.1));
    let _ = writeln!(log, "FAILURE CATEGORIES:");
    for (category, count) in by_count {
        let _ = writeln!(log, "  {category}: {count}");
    }

    let _ = writeln!(log, "\nFAILED CONVERSATION IDs:");
    for failure in failures {
        let _ = writeln!(log, "  - {}", failure.conversation_id);
    }

    let _ = writeln!(log, "\n{RULE}\nDETAILED FAILURE INFORMATION\n{RULE}\n");
    for (n, failure) in failures.iter().enumerate() {
        let _ = writeln!(log, "Failure #{}", n + 1);
        let _ = writeln!(log, "ID: {}", failure.conversation_id);
        let _ = writeln!(log, "Title: {}", failure.title);
        let _ = writeln!(log, "Category: {}", failure.category);
        let _ = writeln!(log, "Error: {}", failure.message);
        if !failure.structural_issues.is_empty() {
            let _ = writeln!(log, "Structural Issues: {}", failure.structural_issues.join(", "));
        }
        if !failure.stats.problematic_nodes.is_empty() {
            let _ = writeln!(log, "\nProblematic Nodes (sample):");
            for node in failure.stats.problematic_nodes.iter().take(3) {
                let _ = writeln!(
                    log,
                    "  - Node {}: role={}, content_type={}, issue={}",
                    node.node_id,
                    node.role.as_deref().unwrap_or("none"),
                    node.content_type.as_deref().unwrap_or("none"),
                    node.issue
                );
            }
        }
        let _ = writeln!(log, "\n{RULE}\n");
    }
    let _ = writeln!(log, "JSON version saved to: {FAILURE_JSON_FILE}");
    log
}
