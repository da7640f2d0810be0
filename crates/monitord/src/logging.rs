//! provides logging helpers

use std::fmt::{self};
use std::path::Path;

use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Writes the pre-encoded metrics line carried in an event's `msg`
/// field, one line per event.
struct MetricsLineFormat;

struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "msg" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "msg" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

impl<S, N> FormatEvent<S, N> for MetricsLineFormat
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);

        match visitor.message {
            Some(message) => writeln!(writer, "{message}"),
            None => Ok(()),
        }
    }
}

/// initiate the global tracing subscriber
///
/// Human-readable logs go to stderr filtered by `RUST_LOG`; events on a
/// `metrics` target are routed to a daily-rotated metrics file when one
/// is configured. The returned guard keeps the non-blocking writer
/// alive.
pub fn init(metrics_file: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.and(filter::filter_fn(|metadata| {
            !metadata.target().contains("metrics")
        })));

    let Some(metrics_file) = metrics_file else {
        registry().with(fmt_layer).init();
        return None;
    };

    let path = match metrics_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file = metrics_file.file_name().expect("metrics file name");

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file.to_str().expect("metrics file name"))
        .max_log_files(3)
        .build(path)
        .expect("failed to create rolling file appender");

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(MetricsLineFormat)
        .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target().contains("metrics")
        }));

    registry().with(fmt_layer).with(metrics_layer).init();
    Some(file_guard)
}
