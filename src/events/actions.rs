//! Action execution for matched events.
//!
//! The action set is closed: `create_note`, `tag`, `ignore`, `spawn_task`.
//! Every execution writes a `running` action log row first and settles it
//! afterwards. Handler errors and panics are captured into a failed
//! [`ActionResult`]; nothing escapes the executor.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ActionError, ConfigError};
use crate::events::model::{ActionResult, ActionStatus, Event, EventSource, RuleAction};
use crate::notes::{NoteRequest, NotesClient};
use crate::store::Database;
use crate::worker::TaskQueue;
use crate::worker::lane::panic_message;

const DEFAULT_NOTE_FOLDER: &str = "Inbox";
const DEFAULT_TASK_QUEUE: &str = "default";

#[derive(Debug, Deserialize)]
struct CreateNoteConfig {
    #[serde(default = "default_folder")]
    folder: String,
    #[serde(default)]
    title_template: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_folder() -> String {
    DEFAULT_NOTE_FOLDER.to_string()
}

#[derive(Debug, Deserialize)]
struct TagConfig {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SpawnTaskConfig {
    #[serde(default)]
    task_name: Option<String>,
    #[serde(default)]
    task_params: Map<String, Value>,
    #[serde(default = "default_queue")]
    queue: String,
}

fn default_queue() -> String {
    DEFAULT_TASK_QUEUE.to_string()
}

fn parse_config<T: DeserializeOwned>(
    action: RuleAction,
    config: &Map<String, Value>,
) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(config.clone())).map_err(|e| {
        ConfigError::InvalidActionConfig {
            action: action.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Check that `config` has the shape `action` expects.
///
/// Missing optional keys are fine; wrong types are not.
pub fn validate_action_config(
    action: RuleAction,
    config: &Map<String, Value>,
) -> Result<(), ConfigError> {
    match action {
        RuleAction::CreateNote => parse_config::<CreateNoteConfig>(action, config).map(|_| ()),
        RuleAction::Tag => parse_config::<TagConfig>(action, config).map(|_| ()),
        RuleAction::SpawnTask => parse_config::<SpawnTaskConfig>(action, config).map(|_| ()),
        RuleAction::Ignore => Ok(()),
    }
}

/// Render a note title from a template with `{subject}`, `{from}`/`{from_}`
/// and `{date}` placeholders.
pub fn render_title(template: &str, event: &Event) -> String {
    let date = event.email_date.map(|d| d.to_rfc3339()).unwrap_or_default();
    let from = event.email_from.as_deref().unwrap_or("");
    template
        .replace("{subject}", event.email_subject.as_deref().unwrap_or(""))
        .replace("{from_}", from)
        .replace("{from}", from)
        .replace("{date}", &date)
}

/// Markdown body for a note created from an event.
pub fn format_event_as_note(event: &Event) -> String {
    let mut lines: Vec<String> = Vec::new();
    if event.source == EventSource::Email {
        let date = event
            .email_date
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "Unknown".to_string());
        lines.push(format!("**From:** {}", event.email_from.as_deref().unwrap_or("Unknown")));
        lines.push(format!("**To:** {}", event.email_to.as_deref().unwrap_or("Unknown")));
        lines.push(format!("**Date:** {date}"));
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());
        lines.push(event.email_body.clone().unwrap_or_default());
    } else {
        lines.push(format!("**Source:** {}", event.source));
        lines.push(format!("**Type:** {}", event.event_type));
        lines.push(String::new());
        lines.push("```json".to_string());
        lines.push(serde_json::to_string_pretty(&event.payload).unwrap_or_else(|_| "{}".into()));
        lines.push("```".to_string());
    }
    lines.join("\n")
}

/// Runs the action of a matched rule against an event.
pub struct ActionExecutor {
    store: Arc<dyn Database>,
    notes: Arc<dyn NotesClient>,
    queue: Arc<dyn TaskQueue>,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn Database>,
        notes: Arc<dyn NotesClient>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            store,
            notes,
            queue,
        }
    }

    /// Execute `action` for `event` and record exactly one action log.
    pub async fn execute_action(
        &self,
        event_id: Uuid,
        rule_id: Uuid,
        action: RuleAction,
        action_config: &Map<String, Value>,
        event: &Event,
    ) -> ActionResult {
        let input = Value::Object(action_config.clone());
        let log_id = match self
            .store
            .insert_action_log(event_id, rule_id, action, &input)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(event_id = %event_id, action = %action, "Failed to write action log, skipping action: {e}");
                return ActionResult::failed(format!("Failed to record action log: {e}"));
            }
        };

        let dispatched = AssertUnwindSafe(self.dispatch(event_id, action, action_config, event))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ActionError::Panicked(panic_message(panic.as_ref()))));

        let result = match dispatched {
            Ok(result) => result,
            Err(e) => {
                warn!(event_id = %event_id, action = %action, "Action failed: {e}");
                ActionResult::failed(e.to_string())
            }
        };

        let status = if result.success {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        if let Err(e) = self
            .store
            .complete_action_log(log_id, status, &result.to_json(), result.error.as_deref())
            .await
        {
            error!(action_log_id = %log_id, "Failed to settle action log: {e}");
        }

        debug!(event_id = %event_id, action = %action, success = result.success, "Action executed");
        result
    }

    async fn dispatch(
        &self,
        event_id: Uuid,
        action: RuleAction,
        config: &Map<String, Value>,
        event: &Event,
    ) -> Result<ActionResult, ActionError> {
        match action {
            RuleAction::CreateNote => self.create_note(event, parse_config(action, config)?).await,
            RuleAction::Tag => self.tag(event_id, parse_config(action, config)?).await,
            RuleAction::Ignore => Ok(ActionResult::ok(json!({"message": "Event ignored"}))),
            RuleAction::SpawnTask => self.spawn_task(event, parse_config(action, config)?).await,
        }
    }

    async fn create_note(
        &self,
        event: &Event,
        config: CreateNoteConfig,
    ) -> Result<ActionResult, ActionError> {
        let title = match config.title_template.as_deref() {
            Some(template) if !template.is_empty() => render_title(template, event),
            _ => event
                .email_subject
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Untitled Event".to_string()),
        };

        let mut frontmatter = Map::new();
        frontmatter.insert("source".into(), json!("event"));
        frontmatter.insert("event_id".into(), json!(event.id.to_string()));

        let note = self
            .notes
            .create_note(NoteRequest {
                title,
                content: format_event_as_note(event),
                tags: config.tags,
                folder: config.folder,
                frontmatter,
            })
            .await?;

        Ok(ActionResult::ok(json!({
            "note_id": note.id,
            "note_path": note.file_path,
        })))
    }

    async fn tag(&self, event_id: Uuid, config: TagConfig) -> Result<ActionResult, ActionError> {
        if config.tags.is_empty() {
            return Ok(ActionResult::ok(json!({"message": "No tags specified"})));
        }

        self.store
            .merge_route_result(event_id, &json!({"tags": config.tags, "tags_added": config.tags}))
            .await?;
        Ok(ActionResult::ok(json!({"tags_added": config.tags})))
    }

    async fn spawn_task(
        &self,
        event: &Event,
        config: SpawnTaskConfig,
    ) -> Result<ActionResult, ActionError> {
        let Some(task_name) = config.task_name.filter(|n| !n.is_empty()) else {
            return Ok(ActionResult::failed("No task_name specified"));
        };

        let mut params = config.task_params;
        params.insert("event_id".into(), json!(event.id.to_string()));
        params.insert(
            "event".into(),
            serde_json::to_value(event).map_err(|e| ActionError::Failed {
                action: RuleAction::SpawnTask.to_string(),
                reason: format!("serialize event: {e}"),
            })?,
        );

        match self
            .queue
            .spawn(&task_name, Value::Object(params), &config.queue)
            .await
        {
            Ok(task_id) => Ok(ActionResult::ok(json!({"task_id": task_id.to_string()}))),
            Err(e) => Ok(ActionResult::failed(format!("Failed to spawn task: {e}"))),
        }
    }
}
