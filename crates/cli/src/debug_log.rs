//! Debug file logging for livesync
//!
//! Every run writes a full trace to `livesync-{session_id}.log`. Commands that
//! operate on a sync root keep it under `<root>/.livesync/logs`, which is never
//! synced; everything else logs to the system temp directory. The file filter
//! can be overridden with `LIVESYNC_LOG` (same syntax as `RUST_LOG`).

use std::path::{Path, PathBuf};

use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use livesync_core::exclude::STATE_DIR;

use crate::progress;

/// Environment variable holding the file log filter
const FILTER_ENV: &str = "LIVESYNC_LOG";

const DEFAULT_FILTER: &str = "warn,livesync=trace,livesync_core=trace,livesync_transport=trace";

/// Logs kept per directory, including the new one
const KEEP_LOGS: usize = 10;

/// Debug log guard - keeps the file logger alive
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Session info returned after initializing debug logging
pub struct SessionInfo {
    pub log_path: PathBuf,
    pub guard: DebugLogGuard,
}

/// Where logs for a run against `root` go, if it has a usable state dir
pub fn log_dir_for(root: Option<&Path>) -> PathBuf {
    root.map(|root| root.join(STATE_DIR).join("logs"))
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .unwrap_or_else(std::env::temp_dir)
}

/// Initialize combined logging: file (detailed) + console (through the
/// progress bars).
///
/// The guard must be kept alive for the duration of the program.
pub fn init(verbose: bool, log_dir: &Path) -> SessionInfo {
    let session_id = uuid::Uuid::new_v4();
    let log_filename = format!("livesync-{session_id}.log");
    let log_path = log_dir.join(&log_filename);
    prune_old_logs(log_dir, KEEP_LOGS - 1);

    let file_appender = tracing_appender::rolling::never(log_dir, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = tracing_subscriber::EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(file_filter);

    // Only our own crates reach the terminal
    let console_level = if verbose { "debug" } else { "info" };
    let console_filter = tracing_subscriber::EnvFilter::new(format!(
        "warn,livesync={console_level},livesync_core={console_level},livesync_transport={console_level}"
    ));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .without_time()
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    SessionInfo {
        log_path,
        guard: DebugLogGuard { _guard: guard },
    }
}

/// Delete all but the `keep` newest livesync logs in `dir`
fn prune_old_logs(dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut logs: Vec<_> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("livesync-") && name.ends_with(".log")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();
    if logs.len() <= keep {
        return;
    }

    logs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in logs.into_iter().skip(keep) {
        // Another run may have removed it already
        let _ = std::fs::remove_file(path);
    }
}
