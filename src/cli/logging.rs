//! Log output for the command-line tool
//!
//! Everything is written to stderr so stdout only carries responses.

use anyhow::Result;
use colored::*;
use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter directive for the given flags, or `None` to defer to `RUST_LOG`
pub fn filter_directive(verbosity: u8, quiet: bool, config_level: &str) -> Option<String> {
    if quiet {
        return Some("error".to_string());
    }
    match verbosity {
        0 if std::env::var("RUST_LOG").is_ok() => None,
        0 => Some(format!("policy_llm={},warn", config_level)),
        1 => Some("policy_llm=debug,info".to_string()),
        2 => Some("policy_llm=trace,debug".to_string()),
        _ => Some("trace".to_string()),
    }
}

pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool, config_level: &str) -> Result<()> {
    let env_filter = match filter_directive(verbosity, quiet, config_level) {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let is_terminal = io::stderr().is_terminal();

    if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()?;
    } else if is_terminal {
        let fmt_layer = fmt::layer()
            .with_ansi(true)
            .with_writer(io::stderr)
            .event_format(ColoredFormatter)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    }

    Ok(())
}

/// Timestamped, level-colored terminal lines
struct ColoredFormatter;

impl<S, N> fmt::FormatEvent<S, N> for ColoredFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} ", now.format("%H:%M:%S").to_string().dimmed())?;

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR".red().bold(),
            Level::WARN => "WARN".yellow().bold(),
            Level::INFO => "INFO".green().bold(),
            Level::DEBUG => "DEBUG".blue().bold(),
            Level::TRACE => "TRACE".purple().bold(),
        };
        write!(writer, "{} ", level)?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}
