//! Logging infrastructure for stagehand.
//!
//! Structured logging using the `tracing` ecosystem:
//!
//! - JSON lines written to `~/.stagehand/logs/stagehand.log` (daily rolling)
//! - Human-readable console output on stderr (worker output only with `-v`)
//! - `RUST_LOG` overrides the default filter
//!
//! Worker output is logged under the [`OUTPUT_TARGET`] target with a `slot`
//! field, so it can be filtered independently of supervisor events.
//!
//! ## Example
//!
//! ```no_run
//! use stagehand_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//! tracing::info!("stagehand started");
//! tracing::debug!(slot = "parallel-1", "starting worker");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::filter_fn,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Result, StagehandError};

/// Tracing target used for lines captured from worker processes.
pub const OUTPUT_TARGET: &str = "stagehand::output";

/// Guard that must be held to ensure log flushing on shutdown.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// File name of the rolling log inside the log directory.
const LOG_FILE: &str = "stagehand.log";

/// `RUST_LOG`, or `stagehand=info` (`debug` when verbose).
fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "stagehand=debug"
        } else {
            "stagehand=info"
        })
    })
}

/// Worker output reaches stderr only when verbose; the log file always has it.
fn shows_on_console(target: &str, verbose: bool) -> bool {
    verbose || target != OUTPUT_TARGET
}

/// Install the global subscriber.
///
/// Supervisor events go to stderr and, as JSON lines, to a daily rolling
/// file under `log_dir` (`~/.stagehand/logs/` when `None`). Keep the
/// returned [`LogGuard`] alive for the lifetime of the process.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = log_dir.map_or_else(default_log_dir, Ok)?;
    std::fs::create_dir_all(&log_dir).map_err(|source| StagehandError::DirectoryCreation {
        path: log_dir.clone(),
        source,
    })?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE));

    let file_layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true);

    let console_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_filter(filter_fn(move |meta| shows_on_console(meta.target(), verbose)));

    tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");
    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Home directory of the current user.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| StagehandError::Internal {
        message: "could not determine home directory".into(),
    })
}

/// Get the default log directory path (`~/.stagehand/logs/`).
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".stagehand").join("logs"))
}

/// Convenience macro for logging slot lifecycle events.
///
/// ```ignore
/// log_slot_event!("parallel-1", "started", pid = 4242);
/// ```
#[macro_export]
macro_rules! log_slot_event {
    ($slot_id:expr, $event:expr) => {
        tracing::info!(
            target: "stagehand::slot",
            slot = %$slot_id,
            event = $event,
            "slot event"
        )
    };
    ($slot_id:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "stagehand::slot",
            slot = %$slot_id,
            event = $event,
            $($field)*,
            "slot event"
        )
    };
}
