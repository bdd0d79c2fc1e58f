// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Level to routing key resolution and topic pattern matching.
//!
//! The same [`RoutingKeyResolver`] must be used by the side that binds queues and the
//! side that publishes: a queue bound to a pattern the publisher never produces
//! silently receives nothing.

use crate::constants::CATCH_ALL_KEY;
use std::collections::BTreeSet;
use std::fmt;

/// Level names understood by producers and collectors.
pub mod level {
    pub const GOOD: &str = "good";
    pub const DEBUG: &str = "dbg";
    pub const WARNING: &str = "wrn";
    pub const ERROR: &str = "err";
    pub const FYI: &str = "fyi";
    pub const PANIC: &str = "panic";
    pub const DUMP: &str = "dmp";
    /// Meta-level marking a successfully finished unit of work.
    pub const SUCCESS: &str = "logDone";
    /// Meta-level marking a failed unit of work.
    pub const FAILURE: &str = "logFail";
}

const WARNING_KEY: &str = "wrn";
const ERROR_KEY: &str = "err";
const FAILURE_KEY: &str = "err.*";
const SUCCESS_KEY: &str = "success.*";

pub const DEFAULT_CATEGORIES: [&str; 4] = [level::DEBUG, level::FYI, level::DUMP, level::GOOD];

/// A routing key or binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key matching every other key.
    #[must_use]
    pub fn catch_all() -> Self {
        Self(CATCH_ALL_KEY.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a message published with `key` is routed to a binding with this pattern.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        topic_matches(&self.0, key)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Maps log levels to routing keys. Total: unknown levels map to `#`.
#[derive(Debug, Clone)]
pub struct RoutingKeyResolver {
    categories: BTreeSet<String>,
}

impl Default for RoutingKeyResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CATEGORIES)
    }
}

impl RoutingKeyResolver {
    /// Creates a resolver where every level in `categories` routes under its own name.
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories
                .into_iter()
                .map(Into::into)
                .filter(|category: &String| is_plain_word(category))
                .collect(),
        }
    }

    #[must_use]
    pub fn resolve(&self, level: &str) -> RoutingKey {
        let key = match level {
            "wrn" | "warn" | "warning" => WARNING_KEY,
            "err" | "error" | level::PANIC => ERROR_KEY,
            level::FAILURE => FAILURE_KEY,
            level::SUCCESS => SUCCESS_KEY,
            category if self.categories.contains(category) => category,
            _ => CATCH_ALL_KEY,
        };
        RoutingKey::new(key)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(String::as_str)
    }
}

// Category tokens become routing keys verbatim, so they must not carry separators or
// wildcards of their own.
fn is_plain_word(word: &str) -> bool {
    !word.is_empty() && !word.contains(['.', '*', '#'])
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one word and
/// `#` matches zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
