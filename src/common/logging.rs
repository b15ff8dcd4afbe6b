//! Logging and tracing configuration
//!
//! In console mode stdout belongs to the REPL, so logs go to stderr.
//! Server modes (remote listener, DAP over stdio) log to a file because
//! their standard streams are either detached or carry protocol traffic.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// Name of the session log file
const LOG_FILE: &str = "session.log";

/// Initialize tracing for the local console (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is WARN; the REPL shares the terminal.
pub fn init_console() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rdbg=warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// Initialize tracing for server modes (file logging)
///
/// Writes to `<data dir>/rdbg/logs/session.log` through a non-blocking
/// appender. The returned guard must be held for the life of the process
/// so buffered lines are flushed. Falls back to stderr when the log
/// directory cannot be created.
pub fn init_server() -> (Option<PathBuf>, Option<WorkerGuard>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rdbg=debug,info"));

    if let Some(log_dir) = paths::log_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .try_init();

            return (Some(log_dir.join(LOG_FILE)), Some(guard));
        }
    }

    // Fallback: stderr only
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init();

    (None, None)
}
