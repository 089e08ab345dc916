//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Startup
//!
//! ```text
//! Source: s3 (3 exclusions)
//! Plugins: geocoding, repo-sync
//! Dispatch: worker-pool, 8 in flight
//! ```
//!
//! ## Progress
//!
//! Interactive terminals get an indicatif bar on stderr; with `--no-ui` or
//! a redirected stderr every finished task prints a plain line instead:
//!
//! ```text
//! [12/40]  30%  new 3  processed 2  skipped 5  failed 0  trips/IMG_1.jpg
//! ```
//!
//! ## Summary
//!
//! ```text
//! Saved manifest.json: 42 photos in 3.2s
//!     New: 3
//!     Processed: 1
//!     Skipped: 38
//!     Deleted: 2
//!         old/c.jpg
//!         old/d.jpg
//!     Failed: 1
//!         bad.jpg: image processing failed: ...
//! ```
//!
//! # Architecture
//!
//! Each block has a `format_*` function (returns lines) for testability and
//! a `print_*` wrapper that does the writing. Format functions are pure.

use crate::builder::BuildSummary;
use crate::progress::{ProgressEvent, ProgressSnapshot};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Seconds with one decimal below a minute, `1m05s` above.
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

// ============================================================================
// Startup
// ============================================================================

pub fn format_startup(
    provider: &str,
    exclusions: usize,
    plugins: &[String],
    dispatch: &str,
) -> Vec<String> {
    let mut lines = Vec::new();
    match exclusions {
        0 => lines.push(format!("Source: {provider}")),
        1 => lines.push(format!("Source: {provider} (1 exclusion)")),
        n => lines.push(format!("Source: {provider} ({n} exclusions)")),
    }
    if !plugins.is_empty() {
        lines.push(format!("Plugins: {}", plugins.join(", ")));
    }
    lines.push(format!("Dispatch: {dispatch}"));
    lines
}

pub fn print_startup(provider: &str, exclusions: usize, plugins: &[String], dispatch: &str) {
    for line in format_startup(provider, exclusions, plugins, dispatch) {
        eprintln!("{line}");
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Bar template for interactive terminals; counts and the current key go
/// in `{msg}`.
pub const PROGRESS_TEMPLATE: &str = "[{pos:>3}/{len}] {bar:30.cyan/blue} {percent:>3}%  {msg}";

/// Counts and current key shared by the bar message and plain lines.
pub fn format_progress_message(snapshot: &ProgressSnapshot) -> String {
    let mut msg = format!(
        "new {}  processed {}  skipped {}  failed {}",
        snapshot.new_count,
        snapshot.processed_count,
        snapshot.skipped_count,
        snapshot.failed_count,
    );
    if let Some(key) = &snapshot.current_key {
        msg.push_str("  ");
        msg.push_str(key);
    }
    msg
}

pub fn format_progress_line(snapshot: &ProgressSnapshot) -> String {
    let width = snapshot.total.to_string().len();
    format!(
        "[{:>width$}/{}] {:>3}%  {}",
        snapshot.completed,
        snapshot.total,
        (snapshot.fraction() * 100.0).round() as u32,
        format_progress_message(snapshot),
    )
}

pub fn format_start(total: usize) -> String {
    match total {
        0 => "Nothing to process".to_string(),
        1 => "Processing 1 photo".to_string(),
        n => format!("Processing {n} photos"),
    }
}

fn progress_bar(total: usize) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(200));
    bar
}

/// Render progress events until the sender side hangs up.
///
/// `live` draws an indicatif bar on stderr; otherwise each event is its own
/// line. The summary goes to stdout, everything else to stderr.
pub fn run_printer(rx: Receiver<ProgressEvent>, live: bool) {
    let mut bar: Option<ProgressBar> = None;
    for event in rx {
        match event {
            ProgressEvent::Start { total } => {
                if let Some(old) = bar.take() {
                    old.finish_and_clear();
                }
                eprintln!("{}", format_start(total));
                if live && total > 0 {
                    bar = Some(progress_bar(total));
                }
            }
            ProgressEvent::Progress(snapshot) => match &bar {
                Some(bar) => {
                    bar.set_length(snapshot.total as u64);
                    bar.set_position(snapshot.completed as u64);
                    bar.set_message(format_progress_message(&snapshot));
                }
                None => eprintln!("{}", format_progress_line(&snapshot)),
            },
            ProgressEvent::Complete(summary) => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                print_summary(&summary);
            }
            ProgressEvent::Error(_) => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
            }
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

// ============================================================================
// Summary
// ============================================================================

pub fn format_summary(summary: &BuildSummary) -> Vec<String> {
    let stats = &summary.stats;
    let photos = if summary.item_count == 1 { "photo" } else { "photos" };
    let mut lines = vec![format!(
        "Saved {}: {} {} in {}",
        summary.manifest_path.display(),
        summary.item_count,
        photos,
        format_duration_ms(summary.elapsed_ms)
    )];
    lines.push(format!("{}New: {}", indent(1), stats.new));
    lines.push(format!("{}Processed: {}", indent(1), stats.processed));
    lines.push(format!("{}Skipped: {}", indent(1), stats.skipped));
    lines.push(format!("{}Deleted: {}", indent(1), stats.deleted));
    for key in &summary.deleted_keys {
        lines.push(format!("{}{}", indent(2), key));
    }
    if stats.failed > 0 {
        lines.push(format!("{}Failed: {}", indent(1), stats.failed));
        for failure in &summary.failures {
            lines.push(format!("{}{}: {}", indent(2), failure.key, failure.error));
        }
    }
    lines
}

pub fn print_summary(summary: &BuildSummary) {
    for line in format_summary(summary) {
        println!("{line}");
    }
}
