use std::{fs, path::Path};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;
pub mod writer;

pub use formatter::*;
pub use writer::*;

use crate::configs::LoggingConfig;

/// Builds the filter directive string from the optional logging section.
///
/// Noisy transport crates are capped at `warn` unless the user's own filters
/// say otherwise (later directives win).
pub fn filter_directives(config: Option<&LoggingConfig>) -> String {
    let level = config.and_then(|l| l.level.as_deref()).unwrap_or("info");
    let filters = config.and_then(|l| l.filters.as_deref()).unwrap_or("");

    let base = format!("{level},tungstenite=warn,tokio_tungstenite=warn,rustls=warn");
    if filters.is_empty() {
        base
    } else {
        format!("{base},{filters}")
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: Option<&LoggingConfig>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let stdout_layer = fmt::layer()
        .event_format(ConsoleFormatter::new(true))
        .with_ansi(true);

    let file_layer = config.and_then(|l| l.file.as_ref()).map(|file_config| {
        if let Some(parent) = Path::new(&file_config.path).parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!("Failed to create log directory: {}", e);
            }
        }

        fmt::layer()
            .with_writer(CappedFileWriter::new(
                file_config.path.clone(),
                file_config.max_lines,
            ))
            .event_format(ConsoleFormatter::new(false))
            .with_ansi(false)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_default_to_info() {
        assert!(filter_directives(None).starts_with("info,"));
    }

    #[test]
    fn user_filters_are_appended_last() {
        let cfg = LoggingConfig {
            level: Some("debug".into()),
            filters: Some("rustacord::voice=trace".into()),
            file: None,
        };
        let d = filter_directives(Some(&cfg));
        assert!(d.starts_with("debug,"));
        assert!(d.ends_with(",rustacord::voice=trace"));
    }
}
