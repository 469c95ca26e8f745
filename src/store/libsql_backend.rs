//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every operation is a single
//! statement so concurrent lanes and HTTP handlers never interleave inside
//! a multi-step write.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::events::model::{
    ActionLog, ActionStatus, Event, EventQuery, EventStatus, NewEvent, NewRule, Rule,
    RuleAction, RuleUpdate, into_map,
};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::worker::state::{QueuedTask, TaskState};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so string order is time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn parse_optional_uuid(s: &Option<String>, column: &str) -> Result<Option<Uuid>, DatabaseError> {
    s.as_deref().map(|s| parse_uuid(s, column)).transpose()
}

/// Parse a JSON text column, falling back to an empty object.
fn parse_json(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::Object(Default::default()))
}

fn to_json_text(value: &Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn col(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("column read: {e}"))
}

const EVENT_COLUMNS: &str = "id, source, source_id, event_type, payload, email_from, email_to, email_subject, email_body, email_date, status, matched_rule_id, route_result, routed_at, owner_id, created_at, updated_at";

const RULE_COLUMNS: &str = "id, name, description, enabled, priority, conditions, action, action_config, match_count, last_matched_at, created_at, updated_at";

const ACTION_LOG_COLUMNS: &str = "id, event_id, rule_id, action, action_input, action_output, status, error, started_at, completed_at";

const TASK_COLUMNS: &str = "id, queue, task_name, params, state, eligible_at, attempts, result, error, created_at, updated_at";

/// Map a libsql Row to an Event.
fn row_to_event(row: &libsql::Row) -> Result<Event, DatabaseError> {
    let id: String = row.get(0).map_err(col)?;
    let source: String = row.get(1).map_err(col)?;
    let payload: String = row.get(4).map_err(col)?;
    let email_date: Option<String> = row.get(9).ok();
    let status: String = row.get(10).map_err(col)?;
    let matched_rule_id: Option<String> = row.get(11).ok();
    let route_result: Option<String> = row.get(12).ok();
    let routed_at: Option<String> = row.get(13).ok();
    let created: String = row.get(15).map_err(col)?;
    let updated: String = row.get(16).map_err(col)?;

    Ok(Event {
        id: parse_uuid(&id, "events.id")?,
        source: source
            .parse()
            .map_err(|e| DatabaseError::Serialization(format!("events.source: {e}")))?,
        source_id: row.get(2).ok(),
        event_type: row.get(3).map_err(col)?,
        payload: parse_json(&payload),
        email_from: row.get(5).ok(),
        email_to: row.get(6).ok(),
        email_subject: row.get(7).ok(),
        email_body: row.get(8).ok(),
        email_date: parse_optional_datetime(&email_date),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        matched_rule_id: parse_optional_uuid(&matched_rule_id, "events.matched_rule_id")?,
        route_result: route_result.as_deref().map(parse_json),
        routed_at: parse_optional_datetime(&routed_at),
        owner_id: row.get(14).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to a Rule.
fn row_to_rule(row: &libsql::Row) -> Result<Rule, DatabaseError> {
    let id: String = row.get(0).map_err(col)?;
    let enabled: i64 = row.get(3).map_err(col)?;
    let conditions: String = row.get(5).map_err(col)?;
    let action: String = row.get(6).map_err(col)?;
    let action_config: String = row.get(7).map_err(col)?;
    let last_matched: Option<String> = row.get(9).ok();
    let created: String = row.get(10).map_err(col)?;
    let updated: String = row.get(11).map_err(col)?;

    Ok(Rule {
        id: parse_uuid(&id, "rules.id")?,
        name: row.get(1).map_err(col)?,
        description: row.get(2).ok(),
        enabled: enabled != 0,
        priority: row.get(4).map_err(col)?,
        conditions: into_map(parse_json(&conditions)),
        action: action
            .parse::<RuleAction>()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        action_config: into_map(parse_json(&action_config)),
        match_count: row.get(8).map_err(col)?,
        last_matched_at: parse_optional_datetime(&last_matched),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a libsql Row to an ActionLog.
fn row_to_action_log(row: &libsql::Row) -> Result<ActionLog, DatabaseError> {
    let id: String = row.get(0).map_err(col)?;
    let event_id: String = row.get(1).map_err(col)?;
    let rule_id: String = row.get(2).map_err(col)?;
    let action: String = row.get(3).map_err(col)?;
    let input: String = row.get(4).map_err(col)?;
    let output: Option<String> = row.get(5).ok();
    let status: String = row.get(6).map_err(col)?;
    let started: String = row.get(8).map_err(col)?;
    let completed: Option<String> = row.get(9).ok();

    Ok(ActionLog {
        id: parse_uuid(&id, "action_logs.id")?,
        event_id: parse_uuid(&event_id, "action_logs.event_id")?,
        rule_id: parse_uuid(&rule_id, "action_logs.rule_id")?,
        action: action
            .parse::<RuleAction>()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        action_input: parse_json(&input),
        action_output: output.as_deref().map(parse_json),
        status: status.parse().map_err(DatabaseError::Serialization)?,
        error: row.get(7).ok(),
        started_at: parse_datetime(&started),
        completed_at: parse_optional_datetime(&completed),
    })
}

/// Map a libsql Row to a QueuedTask.
fn row_to_task(row: &libsql::Row) -> Result<QueuedTask, DatabaseError> {
    let id: String = row.get(0).map_err(col)?;
    let params: String = row.get(3).map_err(col)?;
    let state: String = row.get(4).map_err(col)?;
    let eligible: String = row.get(5).map_err(col)?;
    let result: Option<String> = row.get(7).ok();
    let created: String = row.get(9).map_err(col)?;
    let updated: String = row.get(10).map_err(col)?;

    Ok(QueuedTask {
        id: parse_uuid(&id, "tasks.id")?,
        queue: row.get(1).map_err(col)?,
        task_name: row.get(2).map_err(col)?,
        params: parse_json(&params),
        state: state.parse::<TaskState>().map_err(DatabaseError::Serialization)?,
        eligible_at: parse_datetime(&eligible),
        attempts: row.get(6).map_err(col)?,
        result: result.as_deref().map(parse_json),
        error: row.get(8).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

impl LibSqlBackend {
    /// Run a query expected to return at most one task row.
    async fn query_one_task(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<QueuedTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn set_task_terminal(
        &self,
        id: Uuid,
        state: TaskState,
        result: Option<String>,
        error: Option<&str>,
        op: &str,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET state = ?1, result = ?2, error = ?3, updated_at = ?4 WHERE id = ?5 AND state IN ({})",
                    state_list(&TaskState::predecessors(state))
                ),
                params![
                    state.as_str(),
                    opt_text(result.as_deref()),
                    opt_text(error),
                    ts(Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        if changed == 0 {
            return Err(self.rejected_transition(id, state).await);
        }
        Ok(())
    }

    /// Explain an UPDATE that matched no task row.
    async fn rejected_transition(&self, id: Uuid, to: TaskState) -> DatabaseError {
        match self.get_task(id).await {
            Ok(Some(task)) => DatabaseError::InvalidTransition {
                entity: "task".into(),
                id: id.to_string(),
                from: task.state.to_string(),
                to: to.to_string(),
            },
            Ok(None) => DatabaseError::NotFound {
                entity: "task".into(),
                id: id.to_string(),
            },
            Err(e) => e,
        }
    }
}

/// SQL list of quoted state names.
fn state_list(states: &[TaskState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn upsert_event(&self, event: &NewEvent) -> Result<Event, DatabaseError> {
        let conn = self.conn();
        let now = ts(Utc::now());
        let payload = to_json_text(&event.payload)?;
        let email_date = event.email_date.map(ts);

        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO events (id, source, source_id, event_type, payload, email_from, email_to, email_subject, email_body, email_date, status, owner_id, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11, ?12, ?12) \
                     ON CONFLICT (source, source_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at \
                     RETURNING {EVENT_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    event.source.as_str(),
                    opt_text(event.source_id.as_deref()),
                    event.event_type.clone(),
                    payload,
                    opt_text(event.email_from.as_deref()),
                    opt_text(event.email_to.as_deref()),
                    opt_text(event.email_subject.as_deref()),
                    opt_text(event.email_body.as_deref()),
                    opt_text(email_date.as_deref()),
                    opt_text(event.owner_id.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_event: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let stored = row_to_event(&row)?;
                debug!(event_id = %stored.id, source = %stored.source, "Event upserted");
                Ok(stored)
            }
            Ok(None) => Err(DatabaseError::Query("upsert_event: no row returned".into())),
            Err(e) => Err(DatabaseError::Query(format!("upsert_event: {e}"))),
        }
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_event: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_event(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_event: {e}"))),
        }
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>, DatabaseError> {
        let conn = self.conn();
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = query.status {
            values.push(libsql::Value::Text(status.as_str().into()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(source) = query.source {
            values.push(libsql::Value::Text(source.as_str().into()));
            clauses.push(format!("source = ?{}", values.len()));
        }
        if let Some(from) = query.email_from.as_deref().filter(|f| !f.is_empty()) {
            values.push(libsql::Value::Text(format!("%{}%", from.to_lowercase())));
            clauses.push(format!("LOWER(email_from) LIKE ?{}", values.len()));
        }
        let limit = query.limit.unwrap_or(50).clamp(1, 500);
        values.push(libsql::Value::Integer(limit as i64));
        let limit_idx = values.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events {where_sql} ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_idx}"
                ),
                values,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query_events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query_events: {e}")))?
        {
            match row_to_event(&row) {
                Ok(e) => events.push(e),
                Err(e) => tracing::warn!("Skipping event row: {e}"),
            }
        }
        Ok(events)
    }

    async fn list_pending_event_ids(&self, limit: u32) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id FROM events WHERE status = 'pending' ORDER BY created_at ASC, rowid ASC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_event_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_event_ids: {e}")))?
        {
            let id: String = row.get(0).map_err(col)?;
            match Uuid::parse_str(&id) {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!("Skipping pending event id {id}: {e}"),
            }
        }
        Ok(ids)
    }

    async fn claim_event(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE events SET status = 'claimed', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_event: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_event_routed(
        &self,
        id: Uuid,
        rule_id: Uuid,
        route_result: &Value,
    ) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        self.conn()
            .execute(
                "UPDATE events SET matched_rule_id = ?1, route_result = ?2, routed_at = ?3, updated_at = ?3 WHERE id = ?4",
                params![
                    rule_id.to_string(),
                    to_json_text(route_result)?,
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_event_routed: {e}")))?;
        Ok(())
    }

    async fn set_event_status(
        &self,
        id: Uuid,
        status: EventStatus,
        stamp_routed: bool,
    ) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let sql = if stamp_routed {
            "UPDATE events SET status = ?1, routed_at = ?2, updated_at = ?2 WHERE id = ?3"
        } else {
            "UPDATE events SET status = ?1, updated_at = ?2 WHERE id = ?3"
        };
        self.conn()
            .execute(sql, params![status.as_str(), now, id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("set_event_status: {e}")))?;

        debug!(event_id = %id, status = %status, "Event status updated");
        Ok(())
    }

    async fn merge_route_result(&self, id: Uuid, patch: &Value) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE events SET route_result = json_patch(COALESCE(route_result, '{}'), ?1), updated_at = ?2 WHERE id = ?3",
                params![to_json_text(patch)?, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("merge_route_result: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "event".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn reset_event(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE events SET status = 'pending', matched_rule_id = NULL, route_result = NULL, routed_at = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status != 'claimed'",
                params![ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_event: {e}")))?;
        Ok(changed > 0)
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &NewRule) -> Result<Rule, DatabaseError> {
        let conn = self.conn();
        let id = Uuid::new_v4();
        let now = ts(Utc::now());
        let conditions = to_json_text(&Value::Object(rule.conditions.clone()))?;
        let action_config = to_json_text(&Value::Object(rule.action_config.clone()))?;

        conn.execute(
            "INSERT INTO rules (id, name, description, enabled, priority, conditions, action, action_config, match_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
            params![
                id.to_string(),
                rule.name.clone(),
                opt_text(rule.description.as_deref()),
                rule.enabled as i64,
                rule.priority,
                conditions,
                rule.action.as_str(),
                action_config,
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_rule: {e}")))?;

        debug!(rule_id = %id, name = %rule.name, action = %rule.action, "Rule created");
        self.get_rule(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        })
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_rule(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_rule: {e}"))),
        }
    }

    async fn update_rule(
        &self,
        id: Uuid,
        update: &RuleUpdate,
    ) -> Result<Option<Rule>, DatabaseError> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        let mut push = |column: &str, value: libsql::Value| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };

        if let Some(name) = &update.name {
            push("name", libsql::Value::Text(name.clone()));
        }
        if let Some(description) = &update.description {
            push("description", libsql::Value::Text(description.clone()));
        }
        if let Some(enabled) = update.enabled {
            push("enabled", libsql::Value::Integer(enabled as i64));
        }
        if let Some(priority) = update.priority {
            push("priority", libsql::Value::Integer(priority));
        }
        if let Some(conditions) = &update.conditions {
            push(
                "conditions",
                libsql::Value::Text(to_json_text(&Value::Object(conditions.clone()))?),
            );
        }
        if let Some(action) = update.action {
            push("action", libsql::Value::Text(action.as_str().into()));
        }
        if let Some(config) = &update.action_config {
            push(
                "action_config",
                libsql::Value::Text(to_json_text(&Value::Object(config.clone()))?),
            );
        }
        push("updated_at", libsql::Value::Text(ts(Utc::now())));

        values.push(libsql::Value::Text(id.to_string()));
        let sql = format!(
            "UPDATE rules SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );

        let changed = self
            .conn()
            .execute(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("update_rule: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_rule(id).await
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM rules WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        Ok(changed > 0)
    }

    async fn list_rules(&self, enabled_only: bool) -> Result<Vec<Rule>, DatabaseError> {
        let filter = if enabled_only { "WHERE enabled = 1" } else { "" };
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules {filter} ORDER BY priority DESC, created_at ASC, rowid ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?
        {
            match row_to_rule(&row) {
                Ok(r) => rules.push(r),
                Err(e) => tracing::warn!("Skipping rule row: {e}"),
            }
        }
        Ok(rules)
    }

    async fn record_rule_match(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        self.conn()
            .execute(
                "UPDATE rules SET match_count = match_count + 1, last_matched_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_rule_match: {e}")))?;
        Ok(())
    }

    // ── Action logs ─────────────────────────────────────────────────

    async fn insert_action_log(
        &self,
        event_id: Uuid,
        rule_id: Uuid,
        action: RuleAction,
        input: &Value,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO action_logs (id, event_id, rule_id, action, action_input, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)",
                params![
                    id.to_string(),
                    event_id.to_string(),
                    rule_id.to_string(),
                    action.as_str(),
                    to_json_text(input)?,
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_action_log: {e}")))?;
        Ok(id)
    }

    async fn complete_action_log(
        &self,
        id: Uuid,
        status: ActionStatus,
        output: &Value,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE action_logs SET status = ?1, action_output = ?2, error = ?3, completed_at = ?4 WHERE id = ?5",
                params![
                    status.as_str(),
                    to_json_text(output)?,
                    opt_text(error),
                    ts(Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_action_log: {e}")))?;
        Ok(())
    }

    async fn list_action_logs(&self, event_id: Uuid) -> Result<Vec<ActionLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTION_LOG_COLUMNS} FROM action_logs WHERE event_id = ?1 ORDER BY started_at ASC, rowid ASC"
                ),
                params![event_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_action_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_action_logs: {e}")))?
        {
            match row_to_action_log(&row) {
                Ok(l) => logs.push(l),
                Err(e) => tracing::warn!("Skipping action log row: {e}"),
            }
        }
        Ok(logs)
    }

    // ── Inboxes ─────────────────────────────────────────────────────

    async fn upsert_inbox(&self, email: &str, owner_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO inboxes (email, owner_id) VALUES (?1, ?2) \
                 ON CONFLICT (email) DO UPDATE SET owner_id = excluded.owner_id",
                params![email.trim().to_lowercase(), owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_inbox: {e}")))?;
        Ok(())
    }

    async fn find_inbox_owner(&self, email: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT owner_id FROM inboxes WHERE email = ?1",
                params![email.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_inbox_owner: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get(0).map_err(col)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_inbox_owner: {e}"))),
        }
    }

    // ── Task queue ──────────────────────────────────────────────────

    async fn enqueue_task(
        &self,
        queue: &str,
        task_name: &str,
        params: &Value,
    ) -> Result<QueuedTask, DatabaseError> {
        let now = ts(Utc::now());
        let task = self
            .query_one_task(
                &format!(
                    "INSERT INTO tasks (id, queue, task_name, params, state, eligible_at, attempts, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?5, ?5) RETURNING {TASK_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    queue,
                    task_name,
                    to_json_text(params)?,
                    now
                ],
                "enqueue_task",
            )
            .await?;

        task.ok_or_else(|| DatabaseError::Query("enqueue_task: no row returned".into()))
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<QueuedTask>, DatabaseError> {
        self.query_one_task(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.to_string()],
            "get_task",
        )
        .await
    }

    async fn claim_next_task(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedTask>, DatabaseError> {
        let now = ts(now);
        self.query_one_task(
            &format!(
                "UPDATE tasks SET state = 'running', attempts = attempts + 1, updated_at = ?2 \
                 WHERE id = (SELECT id FROM tasks WHERE queue = ?1 AND state IN ('pending', 'sleeping') AND eligible_at <= ?2 \
                             ORDER BY eligible_at ASC, created_at ASC, rowid ASC LIMIT 1) \
                 RETURNING {TASK_COLUMNS}"
            ),
            params![queue, now],
            "claim_next_task",
        )
        .await
    }

    async fn complete_task(&self, id: Uuid, result: &Value) -> Result<(), DatabaseError> {
        self.set_task_terminal(
            id,
            TaskState::Completed,
            Some(to_json_text(result)?),
            None,
            "complete_task",
        )
        .await
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.set_task_terminal(id, TaskState::Failed, None, Some(error), "fail_task")
            .await
    }

    async fn sleep_task(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
        params: &Value,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET state = 'sleeping', eligible_at = ?1, params = ?2, updated_at = ?3 WHERE id = ?4 AND state IN ({})",
                    state_list(&TaskState::predecessors(TaskState::Sleeping))
                ),
                params![ts(until), to_json_text(params)?, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sleep_task: {e}")))?;

        if changed == 0 {
            return Err(self.rejected_transition(id, TaskState::Sleeping).await);
        }
        Ok(())
    }

    async fn active_tasks(&self, task_name: &str) -> Result<Vec<QueuedTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE task_name = ?1 AND state IN ('pending', 'running', 'sleeping') ORDER BY created_at ASC"
                ),
                params![task_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("active_tasks: {e}")))?
        {
            match row_to_task(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn requeue_running_tasks(&self, queue: &str) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET state = 'pending', updated_at = ?1 WHERE queue = ?2 AND state = 'running'",
                params![ts(Utc::now()), queue],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_running_tasks: {e}")))?;
        Ok(changed as usize)
    }
}
