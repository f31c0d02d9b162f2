//! Cargo-style progress output for livesync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!     Syncing ./site -> ssh:dev@box:22:/srv/site
//!      Synced 14 operations (12 pushed, 2 deleted, 67.44 KiB) in 320ms
//!    Watching for changes (Ctrl+C to stop)
//! ```

use std::io::{self, Write as _};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use livesync_core::session::SyncCounters;
use livesync_core::{SessionReport, SyncReport};

/// Status verbs for cargo-style output (right-aligned to 12 chars)
pub struct Status;

impl Status {
    pub const SYNCING: &str = "Syncing";
    pub const SYNCED: &str = "Synced";
    pub const WATCHING: &str = "Watching";
    pub const STOPPED: &str = "Stopped";
    pub const SCANNED: &str = "Scanned";
}

/// Every bar is drawn through this so log lines can suspend it
static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    print_styled(console::Style::new().green().bold(), status, message);
}

/// Print a cargo-style warning line
pub fn print_warning(status: &str, message: &str) {
    print_styled(console::Style::new().yellow().bold(), status, message);
}

fn print_styled(style: console::Style, status: &str, message: &str) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

/// Console writer for tracing that does not tear active progress bars
#[derive(Debug, Clone, Copy)]
pub struct ProgressWriter;

impl io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        MULTI.suspend(|| io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Progress tracker for one command
pub struct SyncProgress {
    start: Instant,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Spinner shown while the initial sync runs (no per-file totals are
    /// known up front)
    pub fn sync_spinner(&self, description: &str) -> ProgressBar {
        let pb = MULTI.add(ProgressBar::new_spinner());
        let style = ProgressStyle::default_spinner().template("{spinner:.green} {msg:>12} {prefix}");
        if let Ok(style) = style {
            pb.set_style(style);
        }
        pb.set_message(Status::SYNCING);
        pb.set_prefix(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    /// Show the one-shot summary
    pub fn finish_sync(&self, report: &SyncReport) {
        let elapsed = format_elapsed(report.elapsed);
        let summary = summarize(&report.counters);
        if report.is_clean() {
            print_status(Status::SYNCED, &format!("{summary} in {elapsed}"));
        } else {
            print_warning(
                "Finished",
                &format!(
                    "{summary}, {} failed, {} unreadable in {elapsed}",
                    report.failing.len(),
                    report.scan_errors.len()
                ),
            );
        }
    }

    /// Show the summary of a watch session
    pub fn finish_session(&self, report: &SessionReport) {
        let elapsed = format_elapsed(self.start.elapsed());
        let counters = &report.counters;
        let mut message = format!("after {elapsed}: {}", summarize(counters));
        if counters.conflicts_resolved > 0 {
            message.push_str(&format!(
                ", {} conflicts resolved locally",
                counters.conflicts_resolved
            ));
        }
        if report.is_degraded() {
            message.push_str(&format!(", {} paths failing", report.failing.len()));
            print_warning(Status::STOPPED, &message);
        } else {
            print_status(Status::STOPPED, &message);
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// `14 operations (12 pushed, 2 deleted, 67.44 KiB)`
fn summarize(counters: &SyncCounters) -> String {
    let operations = counters.operations();
    if operations == 0 {
        return "already up to date".to_string();
    }

    let mut parts = Vec::new();
    if counters.pushed > 0 {
        parts.push(format!("{} pushed", counters.pushed));
    }
    if counters.pulled > 0 {
        parts.push(format!("{} pulled", counters.pulled));
    }
    let deleted = counters.deleted_remote + counters.deleted_local;
    if deleted > 0 {
        parts.push(format!("{deleted} deleted"));
    }
    let bytes = counters.bytes_pushed + counters.bytes_pulled;
    if bytes > 0 {
        parts.push(humansize::format_size(bytes, humansize::BINARY));
    }
    format!("{operations} operations ({})", parts.join(", "))
}
