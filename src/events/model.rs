//! Core types for the events domain: events, rules, action logs.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ConfigError;

// ── Event ───────────────────────────────────────────────────────────

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Email,
    Webhook,
    Manual,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "webhook" => Ok(Self::Webhook),
            "manual" => Ok(Self::Manual),
            other => Err(ConfigError::UnknownSource(other.to_string())),
        }
    }
}

/// Lifecycle state of an event.
///
/// `Pending → Claimed → {Processed, Failed, Unmatched}`. `Claimed` is held
/// only while a single router call is routing the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Claimed,
    Processed,
    Failed,
    Unmatched,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Unmatched => "unmatched",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Unmatched)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "unmatched" => Ok(Self::Unmatched),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// One ingested unit of external activity awaiting routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source: EventSource,
    /// External dedup key. Unique together with `source`.
    pub source_id: Option<String>,
    pub event_type: String,
    pub payload: Value,

    // Denormalized email fields
    pub email_from: Option<String>,
    pub email_to: Option<String>,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub email_date: Option<DateTime<Utc>>,

    pub status: EventStatus,
    pub matched_rule_id: Option<Uuid>,
    pub route_result: Option<Value>,
    pub routed_at: Option<DateTime<Utc>>,
    pub owner_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Whether the payload carries a non-empty `attachments` entry.
    pub fn has_attachments(&self) -> bool {
        match self.payload.get("attachments") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        }
    }
}

/// Input for `EventRouter::create_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub source: EventSource,
    #[serde(default)]
    pub source_id: Option<String>,
    pub event_type: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default)]
    pub email_from: Option<String>,
    #[serde(default)]
    pub email_to: Option<String>,
    #[serde(default)]
    pub email_subject: Option<String>,
    #[serde(default)]
    pub email_body: Option<String>,
    #[serde(default)]
    pub email_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl NewEvent {
    pub fn new(source: EventSource, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            source,
            source_id: None,
            event_type: event_type.into(),
            payload,
            email_from: None,
            email_to: None,
            email_subject: None,
            email_body: None,
            email_date: None,
            owner_id: None,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.email_from = Some(from.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.email_to = Some(to.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.email_subject = Some(subject.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.email_body = Some(body.into());
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.email_date = Some(date);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// Filters for listing events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQuery {
    pub status: Option<EventStatus>,
    pub source: Option<EventSource>,
    /// Partial, case-insensitive sender match.
    pub email_from: Option<String>,
    pub limit: Option<u32>,
}

// ── Rule ────────────────────────────────────────────────────────────

/// The closed set of actions a rule can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    CreateNote,
    Tag,
    Ignore,
    SpawnTask,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateNote => "create_note",
            Self::Tag => "tag",
            Self::Ignore => "ignore",
            Self::SpawnTask => "spawn_task",
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_note" => Ok(Self::CreateNote),
            "tag" => Ok(Self::Tag),
            "ignore" => Ok(Self::Ignore),
            "spawn_task" => Ok(Self::SpawnTask),
            other => Err(ConfigError::UnknownAction(other.to_string())),
        }
    }
}

/// A named, priority-ordered predicate-to-action mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    /// Higher priority rules are evaluated first.
    pub priority: i64,
    pub conditions: Map<String, Value>,
    pub action: RuleAction,
    pub action_config: Map<String, Value>,
    pub match_count: i64,
    pub last_matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub priority: i64,
    pub conditions: Map<String, Value>,
    pub action: RuleAction,
    pub action_config: Map<String, Value>,
}

impl NewRule {
    pub fn new(name: impl Into<String>, conditions: Value, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            priority: 0,
            conditions: into_map(conditions),
            action,
            action_config: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.action_config = into_map(config);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update for a rule. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub conditions: Option<Map<String, Value>>,
    pub action: Option<RuleAction>,
    pub action_config: Option<Map<String, Value>>,
}

impl RuleUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.enabled.is_none()
            && self.priority.is_none()
            && self.conditions.is_none()
            && self.action.is_none()
            && self.action_config.is_none()
    }
}

/// Coerce a JSON value into an object map; non-objects become empty.
pub fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// The rule selected for an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteMatch {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub action: RuleAction,
    pub action_config: Map<String, Value>,
}

impl RouteMatch {
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            action: rule.action,
            action_config: rule.action_config.clone(),
        }
    }

    /// The `route_result` blob persisted on the event.
    pub fn to_route_result(&self) -> Value {
        serde_json::json!({
            "rule_id": self.rule_id.to_string(),
            "rule_name": self.rule_name,
            "action": self.action.as_str(),
            "action_config": self.action_config,
        })
    }
}

// ── Action log ──────────────────────────────────────────────────────

/// Status of one action execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Running,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// Audit record of a single action execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: Uuid,
    pub event_id: Uuid,
    pub rule_id: Uuid,
    pub action: RuleAction,
    pub action_input: Value,
    pub action_output: Option<Value>,
    pub status: ActionStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result every action handler returns: `{success, error?, ...details}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ActionResult {
    /// Successful result carrying the fields of `details` (an object).
    pub fn ok(details: Value) -> Self {
        Self {
            success: true,
            error: None,
            details: into_map(details),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            details: Map::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "success": self.success }))
    }
}

// ── Processing outcome ──────────────────────────────────────────────

/// Result of routing one event.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub status: EventStatus,
    pub event_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_result: Option<ActionResult>,
}

impl ProcessOutcome {
    pub fn unmatched(event_id: Uuid) -> Self {
        Self {
            status: EventStatus::Unmatched,
            event_id,
            rule_id: None,
            action: None,
            action_result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_event(payload: Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            source: EventSource::Email,
            source_id: Some("m-1".into()),
            event_type: "email.received".into(),
            payload,
            email_from: None,
            email_to: None,
            email_subject: None,
            email_body: None,
            email_date: None,
            status: EventStatus::Pending,
            matched_rule_id: None,
            route_result: None,
            routed_at: None,
            owner_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_terminal_states() {
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Claimed.is_terminal());
        assert!(EventStatus::Processed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
        assert!(EventStatus::Unmatched.is_terminal());
    }

    #[test]
    fn unknown_action_is_config_error() {
        let err = "forward_email".parse::<RuleAction>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAction(ref a) if a == "forward_email"));
        assert_eq!("spawn_task".parse::<RuleAction>().unwrap(), RuleAction::SpawnTask);
    }

    #[test]
    fn attachments_presence() {
        assert!(make_event(json!({"attachments": [{"filename": "a.pdf"}]})).has_attachments());
        assert!(!make_event(json!({"attachments": []})).has_attachments());
        assert!(!make_event(json!({})).has_attachments());
        assert!(!make_event(json!({"attachments": null})).has_attachments());
    }

    #[test]
    fn action_result_serializes_flat() {
        let result = ActionResult::ok(json!({"tags_added": ["support"]}));
        let value = result.to_json();
        assert_eq!(value["success"], true);
        assert_eq!(value["tags_added"], json!(["support"]));
        assert!(value.get("error").is_none());

        let failed = ActionResult::failed("No task_name specified").to_json();
        assert_eq!(failed, json!({"success": false, "error": "No task_name specified"}));
    }

    #[test]
    fn outcome_omits_empty_fields() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(ProcessOutcome::unmatched(id)).unwrap();
        assert_eq!(value, json!({"status": "unmatched", "event_id": id.to_string()}));
    }
}
