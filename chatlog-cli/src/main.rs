//! chatlog CLI - turns ChatGPT `conversations.json` exports into transcripts
//!
//! - `extract`: write Markdown and/or JSON transcripts plus run reports
//! - `schema`: report content types, roles and fields the extractor does not know
//! - `completions`: shell completion scripts

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chatlog_core::output::{write_outcome, JsonMode, OutputFormat, OutputOptions, WriteSummary};
use chatlog_core::pipeline::{run_batch, BatchOptions, BatchOutcome};
use chatlog_core::stream::load_export;
use chatlog_core::ChatlogConfig;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

mod tracing_setup;
mod ui;

use tracing_setup::TracingConfig;

/// Exit status after an interrupted run (128 + SIGINT).
const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "chatlog",
    author,
    version,
    about = "Convert ChatGPT conversation exports into Markdown and JSON transcripts",
    long_about = "Reconstructs the active branch of every conversation in a ChatGPT \
                  conversations.json export and writes it as Markdown with YAML front matter \
                  and/or JSON. Broken conversations are reported, never fatal."
)]
struct Cli {
    /// Suppress progress spinners and bars (for script consumption)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Debug logging (unless RUST_LOG is set)
    #[arg(long, global = true)]
    debug: bool,

    /// Config file (default: <config dir>/chatlog/config.toml)
    #[arg(long, global = true, env = "CHATLOG_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract transcripts from an export
    Extract(ExtractArgs),
    /// Scan an export and report unrecognized schema values
    Schema(SchemaArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct ExtractArgs {
    /// conversations.json (JSON array) or an NDJSON export
    #[arg(value_name = "INPUT", default_value = "conversations.json")]
    input: PathBuf,

    /// Output directory (default: chatlog_out)
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,

    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// One JSON file for the whole export, or one per conversation
    #[arg(long = "json-mode", value_enum)]
    json_mode: Option<JsonModeArg>,

    /// Markdown directory (default: <OUTPUT>/md)
    #[arg(long = "markdown-dir", value_name = "DIR")]
    markdown_dir: Option<PathBuf>,

    /// Per-conversation JSON directory (default: <OUTPUT>/json)
    #[arg(long = "json-dir", value_name = "DIR")]
    json_dir: Option<PathBuf>,

    /// Single-file JSON export path
    #[arg(long = "json-file", value_name = "PATH")]
    json_file: Option<PathBuf>,

    /// Leave file modification times alone
    #[arg(long = "no-timestamps")]
    no_timestamps: bool,

    /// Worker threads (0 = one per CPU, capped at 8)
    #[arg(long, short = 'j')]
    jobs: Option<usize>,

    /// Process everything but write nothing
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Do not write extraction.log into the output directory
    #[arg(long = "no-log-file")]
    no_log_file: bool,
}

#[derive(Parser, Debug)]
struct SchemaArgs {
    #[arg(value_name = "INPUT", default_value = "conversations.json")]
    input: PathBuf,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    #[arg(long, short = 'j')]
    jobs: Option<usize>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum FormatArg {
    Markdown,
    Json,
    Both,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Markdown => OutputFormat::Markdown,
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Both => OutputFormat::Both,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum JsonModeArg {
    Single,
    Multiple,
}

impl From<JsonModeArg> for JsonMode {
    fn from(arg: JsonModeArg) -> Self {
        match arg {
            JsonModeArg::Single => JsonMode::Single,
            JsonModeArg::Multiple => JsonMode::Multiple,
        }
    }
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    ui::init_quiet_mode(cli.quiet);

    match cli.command {
        Commands::Extract(args) => {
            let config = load_config(cli.config.as_deref())?;
            run_extract(args, &config, cli.debug)
        }
        Commands::Schema(args) => {
            let config = load_config(cli.config.as_deref())?;
            run_schema(args, &config, cli.debug)
        }
        Commands::Completions(args) => {
            run_completions(args);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ChatlogConfig> {
    let config = match path {
        Some(path) => ChatlogConfig::load_from(path),
        None => ChatlogConfig::load(),
    };
    config.context("Failed to load chatlog config")
}

/// Defaults, then the config file, then command-line flags.
fn output_options(args: &ExtractArgs, config: &ChatlogConfig) -> OutputOptions {
    let mut options = OutputOptions::default();
    config.apply(&mut options);

    if let Some(dir) = &args.output {
        options.output_dir = dir.clone();
    }
    if let Some(format) = args.format {
        options.format = format.into();
    }
    if let Some(mode) = args.json_mode {
        options.json_mode = mode.into();
    }
    if args.markdown_dir.is_some() {
        options.markdown_dir = args.markdown_dir.clone();
    }
    if args.json_dir.is_some() {
        options.json_dir = args.json_dir.clone();
    }
    if args.json_file.is_some() {
        options.json_file = args.json_file.clone();
    }
    if args.no_timestamps {
        options.preserve_timestamps = false;
    }
    options.dry_run = args.dry_run;
    options.source_file = args
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.input.display().to_string());
    options
}

/// First Ctrl-C stops the batch before the next conversation; a second one exits.
fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(i32::from(INTERRUPTED));
        }
        eprintln!("\nInterrupted: finishing current conversations and writing partial results (Ctrl-C again to abort)");
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn load_records(input: &Path) -> Result<Vec<serde_json::Value>> {
    let pb = ui::spinner(format!("Reading {}", input.display()));
    match load_export(input) {
        Ok(records) => {
            ui::finish_success(pb, format!("Read {} conversations", records.len()));
            Ok(records)
        }
        Err(err) => {
            ui::finish_error(pb, format!("Failed to read {}", input.display()));
            Err(err).with_context(|| format!("Failed to load export {}", input.display()))
        }
    }
}

fn run_batch_with_progress(records: Vec<serde_json::Value>, jobs: usize) -> Result<BatchOutcome> {
    let cancel = install_interrupt_handler()?;
    let options = BatchOptions { jobs, cancel };
    let observer = ui::ProgressObserver::new(records.len());

    let outcome = run_batch(records, &options, &observer).context("Extraction failed")?;
    if outcome.cancelled() {
        observer.abandon(format!(
            "Interrupted after {} of {} conversations",
            outcome.processed(),
            outcome.total
        ));
    } else {
        observer.finish(format!("Processed {} conversations", outcome.processed()));
    }
    Ok(outcome)
}

fn run_extract(args: ExtractArgs, config: &ChatlogConfig, debug: bool) -> Result<ExitCode> {
    let options = output_options(&args, config);
    let log_dir = (!args.no_log_file && !args.dry_run).then(|| options.output_dir.clone());
    let log_file = tracing_setup::init(&TracingConfig { debug, log_dir })?;

    info!(input = %args.input.display(), output = %options.output_dir.display(), "starting extraction");
    let records = load_records(&args.input)?;
    let jobs = args.jobs.or(config.jobs).unwrap_or(0);
    let outcome = run_batch_with_progress(records, jobs)?;

    let output_dir = options.output_dir.clone();
    let dry_run = options.dry_run;
    let summary = write_outcome(&outcome, options)
        .with_context(|| format!("Failed to write output to {}", output_dir.display()))?;

    print_summary(&outcome, &summary, &output_dir, log_file.as_deref(), dry_run);

    if outcome.cancelled() {
        warn!(skipped = outcome.skipped, "extraction interrupted");
        return Ok(ExitCode::from(INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(
    outcome: &BatchOutcome,
    summary: &WriteSummary,
    output_dir: &Path,
    log_file: Option<&Path>,
    dry_run: bool,
) {
    let succeeded = outcome.conversations.len();
    let failed = outcome.failures.len();
    let rate = if outcome.processed() == 0 {
        0.0
    } else {
        succeeded as f64 * 100.0 / outcome.processed() as f64
    };

    println!();
    println!("{}", "=".repeat(60));
    println!(
        "{}",
        if dry_run { "DRY RUN COMPLETE (nothing written)" } else { "EXTRACTION COMPLETE" }
    );
    println!("{}", "=".repeat(60));
    println!("  Total conversations: {}", outcome.total);
    println!("  Successfully processed: {succeeded}");
    println!("  Failed: {failed}");
    println!("  Success rate: {rate:.1}%");
    if outcome.cancelled() {
        println!("  Skipped (interrupted): {}", outcome.skipped);
    }
    println!("  Markdown files: {}", summary.markdown_written);
    println!("  JSON conversations: {}", summary.json_written);
    if let Some(path) = &summary.json_file {
        println!("  JSON export: {}", path.display());
    }
    if summary.write_failures > 0 {
        println!("  Write failures: {}", summary.write_failures);
    }
    if summary.timestamp_sync_failures > 0 {
        println!("  Timestamp sync failures: {}", summary.timestamp_sync_failures);
    }
    if outcome.registry.has_unknowns() {
        println!("  New schema values found, see schema_evolution.log");
    }
    println!("  Output directory: {}", output_dir.display());
    if let Some(path) = log_file {
        println!("  Log file: {}", path.display());
    }
}

fn run_schema(args: SchemaArgs, config: &ChatlogConfig, debug: bool) -> Result<ExitCode> {
    tracing_setup::init(&TracingConfig { debug, log_dir: None })?;

    let records = load_records(&args.input)?;
    let jobs = args.jobs.or(config.jobs).unwrap_or(0);
    let outcome = run_batch_with_progress(records, jobs)?;
    let report = outcome.registry.report();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize schema report")?
        );
    } else {
        println!(
            "Scanned {} conversations ({} failed)\n",
            outcome.total,
            outcome.failures.len()
        );
        print!("{report}");
    }
    Ok(if outcome.cancelled() {
        ExitCode::from(INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    })
}

fn run_completions(args: CompletionsArgs) {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}
