//! Structured tracing setup: an `EnvFilter`-driven subscriber with a stderr
//! sink always on and an optional rolling file sink, plus a noise filter for
//! chatty third-party targets.
//!
//! No panic-hook crash-dump machinery here, since that belongs to a desktop
//! surface this crate does not have.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=warn,libloading=warn";
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "hailoseg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    /// Directory a rolling daily log file is written into, if any. `None`
    /// means stderr-only.
    pub log_dir: Option<PathBuf>,
    /// Additional `verbose` flags from a CLI, each one bumping the default
    /// filter up a level (see [`bump_filter`]).
    pub verbose: u8,
    /// Explicit filter directive, taking precedence over `RUST_LOG` and the
    /// verbose-derived default.
    pub explicit_filter: Option<String>,
    pub default_filter: String,
    pub noise_filter: String,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            verbose: 0,
            explicit_filter: None,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
        }
    }
}

/// Resolve the `EnvFilter` directive string: explicit override, else
/// `RUST_LOG`, else the verbose-bumped default, each case with the noise
/// filter appended so third-party targets never drown out this crate's own
/// spans.
fn resolve_filter(options: &LoggingInitOptions) -> String {
    let base = options
        .explicit_filter
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| bump_filter(&options.default_filter, options.verbose));

    format!("{base},{}", options.noise_filter)
}

/// Bump a base filter level by `verbose` steps along `error < warn < info <
/// debug < trace`. A base that isn't one of those five levels is returned
/// unchanged (the caller passed something more specific than a bare level).
fn bump_filter(base: &str, verbose: u8) -> String {
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    match LEVELS.iter().position(|&l| l == base) {
        Some(index) => {
            let bumped = (index + verbose as usize).min(LEVELS.len() - 1);
            LEVELS[bumped].to_string()
        }
        None => base.to_string(),
    }
}

/// Install the global tracing subscriber. Returns the file-sink
/// [`WorkerGuard`] when `log_dir` is set — the caller must hold it for the
/// process lifetime, or buffered log lines are lost on exit.
pub fn init(options: &LoggingInitOptions) -> Option<WorkerGuard> {
    let filter = resolve_filter(options);

    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    match &options.log_dir {
        Some(dir) => {
            let (appender, guard) = rolling_file_appender(dir);
            let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(appender);

            tracing_subscriber::registry()
                .with(EnvFilter::new(filter))
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(EnvFilter::new(filter))
                .with(stderr_layer)
                .init();
            None
        }
    }
}

fn rolling_file_appender(dir: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, DEFAULT_LOG_FILE_PREFIX);
    tracing_appender::non_blocking(appender)
}
