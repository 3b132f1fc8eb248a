//! Subscriber setup for binaries built on tether.
//!
//! Library code only emits events under the `tether::*` targets below; this
//! module is for the process that owns the global subscriber.

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Overrides every directive built from [`LogConfig`].
pub const FILTER_ENV: &str = "TETHER_LOG";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Parts of the connection core that log under their own target.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum Component {
    Client,
    Session,
    Webrtc,
    Signaling,
    Rpc,
}

impl Component {
    pub fn target(self) -> &'static str {
        match self {
            Component::Client => "tether::client",
            Component::Session => "tether::session",
            Component::Webrtc => "tether::webrtc",
            Component::Signaling => "tether::webrtc::signaling",
            Component::Rpc => "tether::rpc",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    /// Level for `tether` and the binary itself. Dependencies stay at `warn`.
    pub level: LogLevel,
    /// Components logged at `trace` regardless of `level`.
    pub trace: Vec<Component>,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn directives(&self, binary: &str) -> String {
        let level = self.level.directive();
        let mut directives = format!("warn,tether={level},{binary}={level}");
        for component in &self.trace {
            directives.push(',');
            directives.push_str(component.target());
            directives.push_str("=trace");
        }
        directives
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TETHER_LOG filter: {0}")]
    Filter(String),
    #[error("a global subscriber is already installed")]
    AlreadySet,
}

/// Install the global subscriber for `binary` (its crate name as a target).
///
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(config: &LogConfig, binary: &str) -> Result<WorkerGuard, InitError> {
    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => EnvFilter::try_new(custom).map_err(|err| InitError::Filter(err.to_string()))?,
        Err(_) => EnvFilter::new(config.directives(binary)),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let verbose = matches!(config.level, LogLevel::Debug | LogLevel::Trace) || !config.trace.is_empty();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|_| InitError::AlreadySet)?;
    Ok(guard)
}
