// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire representation of a log event.
//!
//! Events travel as JSON objects with capitalised field names:
//!
//! ```text
//! { "Id": "abc", "Host": "api-7f9c", "Msg": "disk full", "Ts": 1700000000000, "Level": "err" }
//! ```
//!
//! `Msg` is either a string or a list of strings. Legacy producers always send
//! `"Id": ""` and may attach fields this crate does not know about; both are accepted.

use crate::errors::{DecodeError, EncodeError};
use serde::{Deserialize, Serialize};

/// The body of a log event: a single text or a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    Text(String),
    Lines(Vec<String>),
}

impl MessagePayload {
    /// Renders the payload as one string, joining lines with `\n`.
    #[must_use]
    pub fn joined(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Lines(lines) => lines.join("\n"),
        }
    }
}

impl From<&str> for MessagePayload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessagePayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<String>> for MessagePayload {
    fn from(lines: Vec<String>) -> Self {
        Self::Lines(lines)
    }
}

/// A structured log event, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Msg")]
    pub message: MessagePayload,
    /// Milliseconds since the unix epoch.
    #[serde(rename = "Ts")]
    pub timestamp: i64,
    #[serde(rename = "Level")]
    pub level: String,
}

impl LogEvent {
    #[must_use]
    pub fn new(
        level: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<MessagePayload>,
        timestamp: i64,
        id: Option<String>,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            message: message.into(),
            timestamp,
            level: level.into(),
        }
    }

    /// Whether the event carries a non-empty correlation id.
    #[must_use]
    pub fn has_id(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
