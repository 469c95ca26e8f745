//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::events::model::{
    ActionLog, ActionStatus, Event, EventQuery, EventStatus, NewEvent, NewRule, Rule,
    RuleAction, RuleUpdate,
};
use crate::worker::state::QueuedTask;

/// Backend-agnostic database trait covering events, rules, action logs,
/// inbox ownership and the durable task queue.
///
/// Every method is a single statement; callers never hold a transaction
/// across an await on another collaborator.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Insert an event, or update payload + updated_at when
    /// (source, source_id) already exists. Returns the stored row.
    async fn upsert_event(&self, event: &NewEvent) -> Result<Event, DatabaseError>;

    /// Get an event by ID.
    async fn get_event(&self, id: Uuid) -> Result<Option<Event>, DatabaseError>;

    /// List events, newest first.
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, DatabaseError>;

    /// Oldest-first IDs of pending events.
    async fn list_pending_event_ids(&self, limit: u32) -> Result<Vec<Uuid>, DatabaseError>;

    /// Atomically move an event from pending to claimed.
    ///
    /// Returns `false` when the event does not exist or is not pending.
    async fn claim_event(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Record the matched rule and route result.
    async fn mark_event_routed(
        &self,
        id: Uuid,
        rule_id: Uuid,
        route_result: &Value,
    ) -> Result<(), DatabaseError>;

    /// Set a terminal status. `stamp_routed` also sets routed_at.
    async fn set_event_status(
        &self,
        id: Uuid,
        status: EventStatus,
        stamp_routed: bool,
    ) -> Result<(), DatabaseError>;

    /// Merge a JSON object into the event's route_result.
    async fn merge_route_result(&self, id: Uuid, patch: &Value) -> Result<(), DatabaseError>;

    /// Reset a settled event to pending and clear routing fields.
    ///
    /// Returns `false` when no terminal-state event with this ID exists.
    async fn reset_event(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &NewRule) -> Result<Rule, DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError>;

    /// Apply a partial update. Returns the updated rule, or `None` if absent.
    async fn update_rule(&self, id: Uuid, update: &RuleUpdate)
    -> Result<Option<Rule>, DatabaseError>;

    /// Returns `true` if a rule was deleted.
    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// All rules, or only enabled ones, in evaluation order
    /// (priority desc, created_at asc, insertion order).
    async fn list_rules(&self, enabled_only: bool) -> Result<Vec<Rule>, DatabaseError>;

    /// Increment match_count and stamp last_matched_at.
    async fn record_rule_match(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Action logs ─────────────────────────────────────────────────

    /// Insert a `running` action log row and return its ID.
    async fn insert_action_log(
        &self,
        event_id: Uuid,
        rule_id: Uuid,
        action: RuleAction,
        input: &Value,
    ) -> Result<Uuid, DatabaseError>;

    /// Settle an action log with its outcome.
    async fn complete_action_log(
        &self,
        id: Uuid,
        status: ActionStatus,
        output: &Value,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Action logs for an event, oldest first.
    async fn list_action_logs(&self, event_id: Uuid) -> Result<Vec<ActionLog>, DatabaseError>;

    // ── Inboxes ─────────────────────────────────────────────────────

    /// Map an inbox address (case-insensitive) to an owner.
    async fn upsert_inbox(&self, email: &str, owner_id: &str) -> Result<(), DatabaseError>;

    /// Owner of an inbox address, if known.
    async fn find_inbox_owner(&self, email: &str) -> Result<Option<String>, DatabaseError>;

    // ── Task queue ──────────────────────────────────────────────────

    /// Enqueue a pending task eligible immediately.
    async fn enqueue_task(
        &self,
        queue: &str,
        task_name: &str,
        params: &Value,
    ) -> Result<QueuedTask, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<QueuedTask>, DatabaseError>;

    /// Claim the next eligible task on `queue`, marking it running.
    async fn claim_next_task(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedTask>, DatabaseError>;

    async fn complete_task(&self, id: Uuid, result: &Value) -> Result<(), DatabaseError>;

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Park a running task until `until`, replacing its params.
    async fn sleep_task(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
        params: &Value,
    ) -> Result<(), DatabaseError>;

    /// Tasks named `task_name` in an active state, across all queues.
    async fn active_tasks(&self, task_name: &str) -> Result<Vec<QueuedTask>, DatabaseError>;

    /// Return `running` tasks on `queue` to `pending`. Returns the count.
    async fn requeue_running_tasks(&self, queue: &str) -> Result<usize, DatabaseError>;
}
