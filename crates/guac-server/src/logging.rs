//! Log levels and tracing subscriber setup.
//!
//! | Level     | Emits                                              |
//! |-----------|----------------------------------------------------|
//! | `quiet`   | nothing                                            |
//! | `errors`  | errors only                                        |
//! | `normal`  | errors, warnings, startup and shutdown messages    |
//! | `verbose` | normal + connection lifecycle and guacd exchange   |
//! | `debug`   | verbose + every instruction forwarded in a session |
//!
//! Error events are written to stderr, everything else to stdout.

use clap::ValueEnum;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    Errors,
    Normal,
    #[default]
    Verbose,
    Debug,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Quiet => LevelFilter::OFF,
            LogLevel::Errors => LevelFilter::ERROR,
            LogLevel::Normal => LevelFilter::INFO,
            LogLevel::Verbose => LevelFilter::DEBUG,
            LogLevel::Debug => LevelFilter::TRACE,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: LogLevel) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.filter().into()));

    let writer = std::io::stderr
        .with_max_level(Level::ERROR)
        .or_else(std::io::stdout);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_target(false)
        .init();
}
