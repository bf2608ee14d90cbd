//! Structured, level-filtered, rotating logging (C2).
//!
//! Grounded on `RobertBendun-harmonia`'s `setup_logging_system`: a daily
//! rolling file appender wrapped in `tracing_appender::non_blocking`, fed
//! into a `tracing_subscriber::registry()` alongside an ANSI stdout layer.
//! This system generalizes that single stream into the four named streams
//! spec.md §4.2 calls for, each with its own retention window. Retention is
//! enforced by a sweep over the log directory rather than by the appender
//! itself (the `tracing-appender` crate rotates by day but doesn't prune).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Retention window, per stream, as specified in spec.md §4.2.
pub struct RetentionPolicy {
    pub error_days: u32,
    pub combined_days: u32,
    pub http_days: u32,
    pub security_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            error_days: 30,
            combined_days: 14,
            http_days: 7,
            security_days: 30,
        }
    }
}

/// Holds the non-blocking writer guards alive for the process lifetime;
/// dropping this flushes all buffered log lines.
pub struct LoggingHandle {
    _guards: Vec<WorkerGuard>,
    dir: PathBuf,
    retention: RetentionPolicy,
}

impl LoggingHandle {
    /// Prunes rotated files older than their stream's retention window.
    /// Intended to be invoked from the same cadence as C11's cleanup pass.
    pub fn prune_expired(&self) {
        let streams = [
            ("error", self.retention.error_days),
            ("combined", self.retention.combined_days),
            ("http", self.retention.http_days),
            ("security", self.retention.security_days),
        ];

        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };

        let now = std::time::SystemTime::now();

        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let Some((_, max_days)) = streams.iter().find(|(prefix, _)| name.starts_with(prefix))
            else {
                continue;
            };

            let age = now
                .duration_since(modified)
                .unwrap_or(Duration::ZERO)
                .as_secs();

            if age > u64::from(*max_days) * 24 * 3600 {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

/// Initializes the global `tracing` subscriber with one stdout layer and
/// four daily-rotating file layers (error/combined/http/security).
///
/// `level_filter` follows `tracing_subscriber::EnvFilter` syntax, e.g.
/// `"info"` or `"jamroom_fabric=debug,actix_web=info"`.
pub fn init(log_dir: impl AsRef<Path>, level_filter: &str) -> LoggingHandle {
    let dir = log_dir.as_ref().to_path_buf();
    let _ = std::fs::create_dir_all(&dir);

    let mut guards = Vec::with_capacity(5);

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let mk_layer = |prefix: &'static str| {
        let appender = tracing_appender::rolling::daily(&dir, prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (writer, guard)
    };

    let (error_writer, error_guard) = mk_layer("error");
    let (combined_writer, combined_guard) = mk_layer("combined");
    let (http_writer, http_guard) = mk_layer("http");
    let (security_writer, security_guard) = mk_layer("security");
    guards.push(error_guard);
    guards.push(combined_guard);
    guards.push(http_guard);
    guards.push(security_guard);

    let env_filter = tracing_subscriber::EnvFilter::try_new(level_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(true).with_writer(stdout_writer))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(combined_writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(error_writer)
                .with_filter(tracing_subscriber::filter::LevelFilter::ERROR),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(http_writer)
                .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
                    meta.target().contains("http") || meta.target().contains("admission")
                })),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(security_writer)
                .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
                    meta.target().contains("security")
                        || meta.target().contains("validate")
                        || meta.target().contains("rate_limit")
                })),
        )
        .init();

    LoggingHandle {
        _guards: guards,
        dir,
        retention: RetentionPolicy::default(),
    }
}
