use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingSection;

const LOG_FILE_PREFIX: &str = "wexlot.log";

/// Pick the filter directive: `RUST_LOG` wins, then `-v`, then the configured level.
fn filter_directive(settings: &LoggingSection, verbose: bool, rust_log: Option<String>) -> String {
    match rust_log.filter(|v| !v.trim().is_empty()) {
        Some(env) => env,
        None if verbose => "debug".to_string(),
        None => settings.level.clone(),
    }
}

/// Install the global subscriber. Hold the returned guard until exit so the
/// file writer flushes.
pub fn init(settings: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(settings, verbose, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &settings.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let text_layer = (!settings.json).then(|| fmt::layer().with_writer(std::io::stderr));
    let json_layer = settings
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
