//! Logging utilities for Dredge
//!
//! Operational logs go to stderr or a log file so that query records on
//! stdout stay machine readable.

use crate::config::LogFormat;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Custom event formatter for Dredge logs
pub struct DredgeFormatter;

impl<S, N> FormatEvent<S, N> for DredgeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // Format timestamp
        let now: chrono::DateTime<chrono::Local> = chrono::Local::now();
        write!(writer, "[{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"))?;

        // Format level
        let level: Level = *event.metadata().level();
        match level {
            Level::TRACE => write!(writer, "TRACE")?,
            Level::DEBUG => write!(writer, "DEBUG")?,
            Level::INFO => write!(writer, "INFO ")?,
            Level::WARN => write!(writer, "WARN ")?,
            Level::ERROR => write!(writer, "ERROR")?,
        }
        write!(writer, "] ")?;

        // Format thread name, capture and workers log side by side
        if let Some(name) = std::thread::current().name() {
            write!(writer, "({}) ", name)?;
        }

        // Format module path
        if let Some(module_path) = event.metadata().module_path() {
            write!(writer, "[{}] ", module_path)?;
        }

        // Format fields
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn make_writer(log_file: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    match log_file {
        Some(path) => {
            let file: File = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}

/// Initialize the logging system
pub fn init_logging(log_level: Level, format: LogFormat, log_file: Option<&str>) -> anyhow::Result<()> {
    let writer: BoxMakeWriter = make_writer(log_file)?;
    let ansi: bool = log_file.is_none();

    let result = match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_ansi(ansi)
            .with_writer(writer)
            .event_format(DredgeFormatter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_writer(writer)
            .json()
            .with_current_span(false)
            .try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_unwritable_log_file() {
        let result = make_writer(Some("/nonexistent/dredge/dredge.log"));
        assert!(result.is_err());
    }

    #[test]
    fn test_log_file_writer() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dredge.log");
        assert!(make_writer(path.to_str()).is_ok());
        assert!(path.exists());
    }
}
