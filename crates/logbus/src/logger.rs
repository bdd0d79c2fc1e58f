// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing formatter for the process's own diagnostics.
//!
//! ```text
//! LOGBUS | INFO | collector > consumer_pool{queue="errors"} | Consumer pool started max_concurrency=50
//! LOGBUS | WARN | Lost broker connection
//! ```
//!
//! Diagnostics go to the process output and never through the bus itself.

use std::fmt;
use tracing_core::{field::Field, Event, Subscriber};
use tracing_subscriber::field::MakeExt;
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const PREFIX: &str = "LOGBUS";
const SPAN_SEPARATOR: &str = " > ";

/// Writes `LOGBUS | LEVEL | [root > span{fields} | ]message fields`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = event.metadata().level();
        write!(writer, "{PREFIX} | {level} | ")?;
        if let Some(path) = span_path(ctx) {
            write!(writer, "{path} | ")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let segments: Vec<String> = ctx
        .event_scope()?
        .from_root()
        .map(|span| {
            let extensions = span.extensions();
            match extensions.get::<FormattedFields<N>>() {
                Some(fields) if !fields.is_empty() => format!("{}{{{fields}}}", span.name()),
                _ => span.name().to_string(),
            }
        })
        .collect();
    (!segments.is_empty()).then(|| segments.join(SPAN_SEPARATOR))
}

fn write_field(
    writer: &mut format::Writer<'_>,
    field: &Field,
    value: &dyn fmt::Debug,
) -> fmt::Result {
    if field.name() == "message" {
        write!(writer, "{value:?}")
    } else {
        write!(writer, "{}={value:?}", field.name())
    }
}

/// Field formatter paired with [`Formatter`]: space separated `name=value` pairs with
/// the message bare, never styled for a terminal.
pub fn plain_fields() -> impl for<'w> FormatFields<'w> + 'static {
    format::debug_fn(write_field).delimited(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_with(emit: impl FnOnce()) -> String {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .fmt_fields(plain_fields())
            .event_format(Formatter)
            .with_writer(capture.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, emit);
        let output = capture.0.lock().unwrap().clone();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_lines_carry_level_and_span_path() {
        let output = capture_with(|| {
            let outer = tracing::info_span!("collector");
            let _outer = outer.enter();
            let inner = tracing::info_span!("consumer_pool", queue = "errors");
            let _inner = inner.enter();
            tracing::warn!(acked = 3, "Delivery rejected");
        });

        assert_eq!(
            output,
            "LOGBUS | WARN | collector > consumer_pool{queue=\"errors\"} | Delivery rejected acked=3\n"
        );
    }

    #[test]
    fn test_lines_outside_spans_have_no_path() {
        let output = capture_with(|| tracing::info!(queues = 2, "Consumer pool started"));

        assert_eq!(output, "LOGBUS | INFO | Consumer pool started queues=2\n");
        assert!(!output.contains('\u{1b}'));
    }
}
