use clap::ValueEnum;
use std::env;
use std::fmt;
use std::io;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ORBIT_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// `::warning::`-style annotations understood by the runner.
    #[default]
    Workflow,
    Plain,
}

pub struct WorkflowCommands;

fn escape_data(message: &str) -> String {
    message
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

impl<S, N> FormatEvent<S, N> for WorkflowCommands
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut message = String::new();
        ctx.format_fields(Writer::new(&mut message), event)?;
        let command = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warning",
            Level::INFO => return writeln!(writer, "{message}"),
            _ => "debug",
        };
        writeln!(writer, "::{command}::{}", escape_data(&message))
    }
}

fn default_directive() -> &'static str {
    match env::var("RUNNER_DEBUG") {
        Ok(value) if value.trim() == "1" => "debug",
        _ => "info",
    }
}

/// Installs the global subscriber. Logs go to stderr when `to_stderr` is set
/// so stdout can carry a machine-readable result.
pub fn init(format: LogFormat, to_stderr: bool) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive()));
    let writer = if to_stderr {
        BoxMakeWriter::new(io::stderr)
    } else {
        BoxMakeWriter::new(io::stdout)
    };
    let registry = tracing_subscriber::registry().with(filter);
    // A second init only happens in tests; the first subscriber stays.
    let _ = match format {
        LogFormat::Workflow => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(WorkflowCommands)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Plain => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(writer),
            )
            .try_init(),
    };
}

pub fn debug_enabled() -> bool {
    tracing::enabled!(Level::DEBUG)
}

pub fn group<'a>(title: &str, lines: impl IntoIterator<Item = &'a str>) {
    tracing::info!("::group::{title}");
    for line in lines {
        if !line.trim().is_empty() {
            tracing::debug!("{line}");
        }
    }
    tracing::info!("::endgroup::");
}
