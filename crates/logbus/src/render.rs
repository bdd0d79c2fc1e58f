// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns decoded events into operator lines.

use crate::event::LogEvent;
use crate::rotation::RotatingFile;
use crate::routing::level;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

const NO_ID: &str = "■■■■■■■■■■■■■■■■■■■■■■■■";
const HOST_COLUMN_WIDTH: usize = 30;
const LINE_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Receives every event that was decoded and acknowledged.
///
/// Called from a consumer pool worker slot; implementations must return quickly.
pub trait Renderer: Send + Sync + 'static {
    fn on_decoded(&self, event: LogEvent);
}

/// Where a [`HostTag`] looks for its pattern in the lower-cased host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMatch {
    Prefix(String),
    Suffix(String),
}

/// Abbreviates hosts matching a pattern to a short tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostTag {
    #[serde(rename = "match")]
    pub matcher: HostMatch,
    pub tag: String,
}

impl HostTag {
    pub fn prefix(pattern: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            matcher: HostMatch::Prefix(pattern.into()),
            tag: tag.into(),
        }
    }

    pub fn suffix(pattern: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            matcher: HostMatch::Suffix(pattern.into()),
            tag: tag.into(),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match &self.matcher {
            HostMatch::Prefix(pattern) => host.starts_with(pattern.as_str()),
            HostMatch::Suffix(pattern) => host.ends_with(pattern.as_str()),
        }
    }
}

/// Formats `|<lvl>|<host>|<id>|<msg>`.
#[derive(Debug, Clone, Default)]
pub struct LineFormatter {
    host_tags: Vec<HostTag>,
}

impl LineFormatter {
    #[must_use]
    pub fn new(host_tags: Vec<HostTag>) -> Self {
        Self { host_tags }
    }

    #[must_use]
    pub fn format(&self, event: &LogEvent) -> String {
        let id = match event.id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => NO_ID,
        };
        format!(
            "|{}|{}|{}|{}",
            level_tag(&event.level),
            self.host_column(&event.host),
            id,
            event.message.joined()
        )
    }

    fn host_column(&self, host: &str) -> String {
        let host = host.to_lowercase();
        match self.host_tags.iter().find(|tag| tag.matches(&host)) {
            // The last dash-separated segment is the container id.
            Some(tag) => {
                let instance = host.rsplit('-').next().unwrap_or_default();
                format!("{}|{}", tag.tag, instance)
            }
            None => format!("{host:<width$}", width = HOST_COLUMN_WIDTH),
        }
    }
}

fn level_tag(level: &str) -> &'static str {
    match level {
        level::DUMP => "dmp",
        level::DEBUG => "dbg",
        level::WARNING | "warn" | "warning" => "wrn",
        level::ERROR | "error" | level::PANIC => "pnc",
        level::SUCCESS => "fin",
        level::FAILURE => "err",
        _ => "fyi",
    }
}

/// Writes formatted lines, prefixed with the UTC time, to a rotating file and
/// optionally to stdout.
pub struct SinkRenderer {
    formatter: LineFormatter,
    file: Option<Arc<RotatingFile>>,
    echo_stdout: bool,
}

impl SinkRenderer {
    #[must_use]
    pub fn new(formatter: LineFormatter, file: Option<Arc<RotatingFile>>, echo_stdout: bool) -> Self {
        Self {
            formatter,
            file,
            echo_stdout,
        }
    }

    /// Renders to stdout only, for when the file sink could not be opened.
    #[must_use]
    pub fn console(formatter: LineFormatter) -> Self {
        Self::new(formatter, None, true)
    }

    /// Formats `event` stamped with the time it is written, not the producer's `Ts`.
    #[must_use]
    pub fn render(&self, event: &LogEvent) -> String {
        self.render_at(event, Utc::now())
    }

    #[must_use]
    pub fn render_at(&self, event: &LogEvent, written: DateTime<Utc>) -> String {
        format!(
            "{} {}",
            written.format(LINE_TIME_FORMAT),
            self.formatter.format(event)
        )
    }
}

impl Renderer for SinkRenderer {
    fn on_decoded(&self, event: LogEvent) {
        let line = self.render(&event);
        if let Some(file) = &self.file {
            if let Err(e) = file.write_line(&line) {
                error!("Failed to write log line to {}: {e}", file.path().display());
            }
        }
        if self.echo_stdout {
            println!("{line}");
        }
    }
}
