//! Rule condition matching.
//!
//! Pure predicate evaluation over an [`Event`]. Conditions are ANDed, the
//! first failing predicate short-circuits, and anything the matcher does not
//! understand (unknown keys, wrong JSON types, invalid regexes) fails closed.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tracing::debug;

use crate::events::model::{Event, EventSource};

/// Cap on cached `subject_matches` patterns; the cache is cleared when full.
const REGEX_CACHE_LIMIT: usize = 512;

/// Compiled `subject_matches` patterns. `None` marks an invalid pattern.
static REGEX_CACHE: LazyLock<Mutex<HashMap<String, Option<Regex>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The condition keys a rule may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionKind {
    FromContains,
    FromEquals,
    ToContains,
    ToEquals,
    SubjectContains,
    SubjectEquals,
    SubjectMatches,
    BodyContains,
    HasAttachment,
    EventTypeEquals,
    SourceEquals,
}

impl ConditionKind {
    fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "from_contains" => Self::FromContains,
            "from_equals" => Self::FromEquals,
            "to_contains" => Self::ToContains,
            "to_equals" => Self::ToEquals,
            "subject_contains" => Self::SubjectContains,
            "subject_equals" => Self::SubjectEquals,
            "subject_matches" => Self::SubjectMatches,
            "body_contains" => Self::BodyContains,
            "has_attachment" => Self::HasAttachment,
            "event_type_equals" => Self::EventTypeEquals,
            "source_equals" => Self::SourceEquals,
            _ => return None,
        })
    }
}

/// Whether `event` satisfies every entry in `conditions`.
///
/// An empty condition map matches everything.
pub fn matches_conditions(event: &Event, conditions: &Map<String, Value>) -> bool {
    conditions
        .iter()
        .all(|(key, value)| check_condition(event, key, value))
}

fn check_condition(event: &Event, key: &str, value: &Value) -> bool {
    let Some(kind) = ConditionKind::from_key(key) else {
        debug!(condition = key, "Unknown condition type, failing closed");
        return false;
    };

    if kind == ConditionKind::HasAttachment {
        return match value.as_bool() {
            Some(expected) => event.has_attachments() == expected,
            None => false,
        };
    }

    let Some(expected) = value.as_str() else {
        return false;
    };

    match kind {
        ConditionKind::FromContains => contains(event.email_from.as_deref(), expected),
        ConditionKind::FromEquals => equals(event.email_from.as_deref(), expected),
        ConditionKind::ToContains => contains(event.email_to.as_deref(), expected),
        ConditionKind::ToEquals => equals(event.email_to.as_deref(), expected),
        ConditionKind::SubjectContains => contains(event.email_subject.as_deref(), expected),
        ConditionKind::SubjectEquals => equals(event.email_subject.as_deref(), expected),
        ConditionKind::SubjectMatches => regex_search(event.email_subject.as_deref(), expected),
        ConditionKind::BodyContains => contains(event.email_body.as_deref(), expected),
        ConditionKind::EventTypeEquals => event.event_type == expected,
        ConditionKind::SourceEquals => event.source.as_str() == expected,
        ConditionKind::HasAttachment => false,
    }
}

/// Case-insensitive substring test. Empty text or needle never matches.
fn contains(text: Option<&str>, needle: &str) -> bool {
    match text {
        Some(text) if !text.is_empty() && !needle.is_empty() => {
            text.to_lowercase().contains(&needle.to_lowercase())
        }
        _ => false,
    }
}

/// Case-insensitive equality. An empty expected value only equals an
/// absent or empty field.
fn equals(text: Option<&str>, expected: &str) -> bool {
    let text = text.unwrap_or("");
    if text.is_empty() || expected.is_empty() {
        return text.is_empty() && expected.is_empty();
    }
    text.to_lowercase() == expected.to_lowercase()
}

fn regex_search(text: Option<&str>, pattern: &str) -> bool {
    let Some(text) = text.filter(|t| !t.is_empty()) else {
        return false;
    };
    if pattern.is_empty() {
        return false;
    }
    cached_regex(pattern).is_some_and(|re| re.is_match(text))
}

/// Compile `pattern` case-insensitively, once per distinct pattern.
fn cached_regex(pattern: &str) -> Option<Regex> {
    let mut cache = REGEX_CACHE.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(entry) = cache.get(pattern) {
        return entry.clone();
    }
    if cache.len() >= REGEX_CACHE_LIMIT {
        cache.clear();
    }
    let compiled = match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            debug!(pattern, "Invalid subject_matches pattern: {e}");
            None
        }
    };
    cache.insert(pattern.to_string(), compiled.clone());
    compiled
}

/// Short human-readable summary of an event.
pub fn event_summary(event: &Event) -> String {
    match event.source {
        EventSource::Email => {
            let sender = event.email_from.as_deref().unwrap_or("unknown");
            let subject: String = event
                .email_subject
                .as_deref()
                .unwrap_or("no subject")
                .chars()
                .take(50)
                .collect();
            format!("Email from {sender}: {subject}")
        }
        _ => format!("{}/{}", event.source, event.event_type),
    }
}
