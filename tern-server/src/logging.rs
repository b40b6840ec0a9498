use std::path::PathBuf;
use tern_core::Properties;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    prelude::*,
    EnvFilter,
};

const DEFAULT_FILTER: &str = "tern=info,warn";

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Directory of the daily-rolling log file; console only when unset.
    pub directory: Option<PathBuf>,
    pub prefix: String,
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            directory: None,
            prefix: "tern".to_string(),
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LogOptions {
    /// Read `Tern.LogDir`, `Tern.LogPrefix` and `Tern.LogFilter`.
    pub fn from_properties(props: &Properties) -> Self {
        let defaults = Self::default();
        Self {
            directory: props.get("Tern.LogDir").map(PathBuf::from),
            prefix: props.get_or("Tern.LogPrefix", &defaults.prefix).to_string(),
            filter: props.get_or("Tern.LogFilter", &defaults.filter).to_string(),
        }
    }
}

/// Install the global subscriber: console output plus, when a directory is
/// configured, a daily-rolling file. Keep the returned guard alive for as
/// long as file output is wanted.
pub fn init_logging(options: &LogOptions) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&options.filter)?,
    };

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &options.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(&options.prefix)
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(directory = ?options.directory, "logging initialized");
    Ok(guard)
}

/// Console-only logging for tests; repeated calls are harmless.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tern=trace,debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_properties() {
        let mut props = Properties::new();
        props.set("Tern.LogDir", "/tmp/tern-logs");
        props.set("Tern.LogFilter", "tern::retry=debug");
        let options = LogOptions::from_properties(&props);
        assert_eq!(options.directory, Some(PathBuf::from("/tmp/tern-logs")));
        assert_eq!(options.prefix, "tern");
        assert_eq!(options.filter, "tern::retry=debug");
    }

    #[test]
    fn test_default_options() {
        assert_eq!(LogOptions::from_properties(&Properties::new()), LogOptions::default());
    }
}
