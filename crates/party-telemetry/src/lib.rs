//! Logging setup shared by the watch-party binaries.
//!
//! Each binary describes itself with a [`Profile`]: the crate targets that
//! follow the verbose levels and the prefix of its override variables.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Dependencies that emit per-packet events at trace level.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "tungstenite",
    "tokio_tungstenite",
    "hyper",
    "h2",
    "tower_http",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Profile {
    /// Crates whose own events follow `--log-level` past info.
    pub targets: &'static [&'static str],
    /// `<prefix>_LOG_FILTER` replaces the computed filter and
    /// `<prefix>_TRACE_DEPS` lifts the cap on noisy dependencies.
    pub env_prefix: &'static str,
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// Keeps the background writer running. Hold it until the process exits so
/// buffered lines are flushed.
#[must_use = "dropping the guard stops the log writer"]
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Installs the global subscriber for a binary.
pub fn init(profile: &Profile, config: &LogConfig) -> Result<LogGuard, InitError> {
    let directives = match env_value(profile, "LOG_FILTER").filter(|f| !f.trim().is_empty()) {
        Some(filter) => Directives {
            filter,
            throttled: false,
        },
        None => {
            let allow_deps = env_value(profile, "TRACE_DEPS").is_some_and(|v| truthy(&v));
            directives(profile, config.level, allow_deps)
        }
    };

    let (writer, worker) = match &config.file {
        Some(path) => tracing_appender::non_blocking(open_log_file(path)?),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&directives.filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|_| InitError::AlreadyInstalled)?;

    if directives.throttled {
        tracing::info!(
            "dependency traces capped at info; set {}_TRACE_DEPS=1 to see them",
            profile.env_prefix
        );
    }
    Ok(LogGuard { _worker: worker })
}

#[derive(Debug, PartialEq, Eq)]
struct Directives {
    filter: String,
    throttled: bool,
}

fn directives(profile: &Profile, level: LogLevel, allow_deps: bool) -> Directives {
    let own = |level: LogLevel| {
        profile
            .targets
            .iter()
            .map(move |target| format!("{target}={}", level.as_str()))
    };
    let mut parts: Vec<String> = Vec::new();
    let throttled = match level {
        LogLevel::Trace if allow_deps => {
            parts.push("trace".into());
            false
        }
        LogLevel::Trace => {
            parts.push("debug".into());
            parts.extend(own(LogLevel::Trace));
            parts.extend(NOISY_DEPENDENCIES.iter().map(|dep| format!("{dep}=info")));
            true
        }
        LogLevel::Debug => {
            parts.push("info".into());
            parts.extend(own(LogLevel::Debug));
            false
        }
        quieter => {
            parts.push(quieter.as_str().into());
            false
        }
    };
    Directives {
        filter: parts.join(","),
        throttled,
    }
}

fn env_value(profile: &Profile, suffix: &str) -> Option<String> {
    std::env::var(format!("{}_{suffix}", profile.env_prefix)).ok()
}

fn truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty()
        || value == "0"
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("off"))
}

fn open_log_file(path: &Path) -> Result<File, InitError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}
