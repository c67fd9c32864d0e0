//! Progress feedback for the chatlog CLI
//!
//! Spinners and bars are suppressed when:
//! - `--quiet` flag is passed
//! - `CHATLOG_QUIET=1` environment variable is set
//! - stderr is not a TTY (piped output)

use std::io::IsTerminal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use chatlog_core::pipeline::BatchObserver;
use chatlog_core::{Conversation, ExtractionFailure};
use indicatif::{ProgressBar, ProgressStyle};

/// Global quiet mode state
static QUIET_MODE: OnceLock<bool> = OnceLock::new();

/// Call once at startup with the --quiet flag value.
pub fn init_quiet_mode(quiet_flag: bool) {
    let is_quiet = quiet_flag
        || std::env::var("CHATLOG_QUIET").map(|v| v == "1").unwrap_or(false)
        || !std::io::stderr().is_terminal();

    QUIET_MODE.set(is_quiet).ok();
}

pub fn is_quiet() -> bool {
    *QUIET_MODE.get().unwrap_or(&false)
}

/// Create a spinner that respects quiet mode
pub fn spinner(msg: impl Into<String>) -> Option<ProgressBar> {
    if is_quiet() {
        return None;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
            .template("{spinner:.cyan} {msg}")
            .expect("valid template"),
    );
    pb.set_message(msg.into());
    pb.enable_steady_tick(Duration::from_millis(80));
    Some(pb)
}

/// Create a bounded progress bar that respects quiet mode
pub fn progress_bar(len: u64, msg: impl Into<String>) -> Option<ProgressBar> {
    if is_quiet() {
        return None;
    }

    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:30.cyan/dim}] {pos}/{len} ({eta})")
            .expect("valid template")
            .progress_chars("━╸─"),
    );
    pb.set_message(msg.into());
    Some(pb)
}

pub fn finish_success(pb: Option<ProgressBar>, msg: impl Into<String>) {
    if let Some(pb) = pb {
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{msg}")
                .expect("valid template"),
        );
        pb.finish_with_message(format!("✓ {}", msg.into()));
    }
}

pub fn finish_error(pb: Option<ProgressBar>, msg: impl Into<String>) {
    if let Some(pb) = pb {
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{msg}")
                .expect("valid template"),
        );
        pb.finish_with_message(format!("✗ {}", msg.into()));
    }
}

/// Advances a progress bar as conversations finish.
pub struct ProgressObserver {
    bar: Option<ProgressBar>,
    failed: AtomicUsize,
}

impl ProgressObserver {
    pub fn new(total: usize) -> Self {
        Self {
            bar: progress_bar(total as u64, "Extracting"),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn finish(self, msg: impl Into<String>) {
        finish_success(self.bar, msg);
    }

    pub fn abandon(self, msg: impl Into<String>) {
        finish_error(self.bar, msg);
    }
}

impl BatchObserver for ProgressObserver {
    fn on_success(&self, _conversation: &Conversation) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn on_failure(&self, _failure: &ExtractionFailure) {
        let failed = self.failed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(bar) = &self.bar {
            bar.set_message(format!("Extracting ({failed} failed)"));
            bar.inc(1);
        }
    }
}
