//! Event router.
//!
//! Owns the event lifecycle: ingestion (with inbox owner resolution),
//! first-match rule selection, the pending → claimed claim, action
//! execution and the terminal status write. Also fronts rule management so
//! rule definitions are validated in one place.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, RouterError};
use crate::events::actions::{ActionExecutor, validate_action_config};
use crate::events::matcher::{event_summary, matches_conditions};
use crate::events::model::{
    Event, EventStatus, NewEvent, NewRule, ProcessOutcome, RouteMatch, Rule, RuleUpdate,
};
use crate::store::Database;

/// Summary of a pending-event sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PendingSummary {
    pub processed: usize,
    pub failed: usize,
    pub unmatched: usize,
    /// Events another caller claimed first.
    pub skipped: usize,
    pub total: usize,
    pub results: Vec<Value>,
}

/// First rule in evaluation order whose conditions match `event`.
///
/// `rules` must already be in evaluation order.
pub fn select_rule<'a>(event: &Event, rules: &'a [Rule]) -> Option<&'a Rule> {
    rules
        .iter()
        .filter(|r| r.enabled)
        .find(|r| matches_conditions(event, &r.conditions))
}

/// Turn a processing result into the JSON returned at the boundary:
/// the outcome itself, or `{"error": ...}` for expected routing failures.
pub fn process_result_json(
    result: Result<ProcessOutcome, RouterError>,
) -> Result<Value, DatabaseError> {
    match result {
        Ok(outcome) => Ok(serde_json::to_value(&outcome)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?),
        Err(RouterError::Database(e)) => Err(e),
        Err(e) => Ok(json!({ "error": e.to_string() })),
    }
}

/// Strip a display name: `Support <support@x.com>` → `support@x.com`.
fn bare_address(addr: &str) -> &str {
    match (addr.find('<'), addr.rfind('>')) {
        (Some(start), Some(end)) if start < end => addr[start + 1..end].trim(),
        _ => addr.trim(),
    }
}

pub struct EventRouter {
    store: Arc<dyn Database>,
    executor: Arc<ActionExecutor>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn Database>, executor: Arc<ActionExecutor>) -> Self {
        Self { store, executor }
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Create an event, or refresh the payload of an existing
    /// (source, source_id) pair.
    pub async fn create_event(&self, mut event: NewEvent) -> Result<Event, RouterError> {
        if event.owner_id.is_none()
            && let Some(to) = event.email_to.as_deref()
        {
            event.owner_id = self.owner_for_recipients(to).await?;
        }
        let stored = self.store.upsert_event(&event).await?;
        debug!(event_id = %stored.id, summary = %event_summary(&stored), "Event ingested");
        Ok(stored)
    }

    /// Owner of the first recipient that is a known inbox.
    async fn owner_for_recipients(&self, email_to: &str) -> Result<Option<String>, DatabaseError> {
        for addr in email_to.split(',') {
            let addr = bare_address(addr).to_lowercase();
            if addr.is_empty() {
                continue;
            }
            if let Some(owner) = self.store.find_inbox_owner(&addr).await? {
                return Ok(Some(owner));
            }
        }
        Ok(None)
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Enabled rules in evaluation order.
    pub async fn get_enabled_rules(&self) -> Result<Vec<Rule>, RouterError> {
        Ok(self.store.list_rules(true).await?)
    }

    /// The first enabled rule matching `event`, if any.
    pub async fn route_event(&self, event: &Event) -> Result<Option<RouteMatch>, RouterError> {
        let rules = self.get_enabled_rules().await?;
        Ok(select_rule(event, &rules).map(RouteMatch::from_rule))
    }

    /// Route one pending event and run its action.
    pub async fn process_event(&self, event_id: Uuid) -> Result<ProcessOutcome, RouterError> {
        if !self.store.claim_event(event_id).await? {
            return Err(match self.store.get_event(event_id).await? {
                None => RouterError::NotFound { id: event_id },
                Some(event) => RouterError::AlreadyProcessed {
                    id: event_id,
                    status: event.status.to_string(),
                },
            });
        }

        match self.process_claimed(event_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Never leave an event stranded in `claimed`.
                if let Err(release) = self
                    .store
                    .set_event_status(event_id, EventStatus::Failed, false)
                    .await
                {
                    warn!(event_id = %event_id, "Failed to release claimed event: {release}");
                }
                Err(e)
            }
        }
    }

    async fn process_claimed(&self, event_id: Uuid) -> Result<ProcessOutcome, RouterError> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(RouterError::NotFound { id: event_id })?;

        let Some(route) = self.route_event(&event).await? else {
            self.store
                .set_event_status(event_id, EventStatus::Unmatched, true)
                .await?;
            info!(event_id = %event_id, summary = %event_summary(&event), "Event unmatched");
            return Ok(ProcessOutcome::unmatched(event_id));
        };

        self.store
            .mark_event_routed(event_id, route.rule_id, &route.to_route_result())
            .await?;
        if let Err(e) = self.store.record_rule_match(route.rule_id).await {
            warn!(rule_id = %route.rule_id, "Failed to update rule match stats: {e}");
        }

        let action_result = self
            .executor
            .execute_action(event_id, route.rule_id, route.action, &route.action_config, &event)
            .await;

        let status = if action_result.success {
            EventStatus::Processed
        } else {
            EventStatus::Failed
        };
        self.store.set_event_status(event_id, status, false).await?;

        info!(
            event_id = %event_id,
            rule = %route.rule_name,
            action = %route.action,
            status = %status,
            summary = %event_summary(&event),
            "Event routed"
        );

        Ok(ProcessOutcome {
            status,
            event_id,
            rule_id: Some(route.rule_id),
            action: Some(route.action),
            action_result: Some(action_result),
        })
    }

    /// Reset a settled event to pending and process it again.
    pub async fn reprocess_event(&self, event_id: Uuid) -> Result<ProcessOutcome, RouterError> {
        if !self.store.reset_event(event_id).await? {
            return Err(match self.store.get_event(event_id).await? {
                None => RouterError::NotFound { id: event_id },
                Some(event) => RouterError::AlreadyProcessed {
                    id: event_id,
                    status: event.status.to_string(),
                },
            });
        }
        debug!(event_id = %event_id, "Event reset for reprocessing");
        self.process_event(event_id).await
    }

    /// Process up to `limit` pending events, oldest first.
    ///
    /// Per-event errors are collected into the summary.
    pub async fn process_pending(&self, limit: u32) -> Result<PendingSummary, RouterError> {
        let ids = self.store.list_pending_event_ids(limit).await?;
        let mut summary = PendingSummary {
            total: ids.len(),
            ..Default::default()
        };

        for id in ids {
            match self.process_event(id).await {
                Ok(outcome) => {
                    match outcome.status {
                        EventStatus::Processed => summary.processed += 1,
                        EventStatus::Unmatched => summary.unmatched += 1,
                        _ => summary.failed += 1,
                    }
                    summary.results.push(
                        serde_json::to_value(&outcome)
                            .unwrap_or_else(|_| json!({"event_id": id.to_string()})),
                    );
                }
                Err(RouterError::AlreadyProcessed { .. }) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    summary
                        .results
                        .push(json!({"event_id": id.to_string(), "error": e.to_string()}));
                }
            }
        }

        if summary.total > 0 {
            info!(
                total = summary.total,
                processed = summary.processed,
                unmatched = summary.unmatched,
                failed = summary.failed,
                "Pending events swept"
            );
        }
        Ok(summary)
    }

    // ── Rules ───────────────────────────────────────────────────────

    pub async fn create_rule(&self, rule: NewRule) -> Result<Rule, RouterError> {
        validate_action_config(rule.action, &rule.action_config)?;
        Ok(self.store.create_rule(&rule).await?)
    }

    /// Returns `None` when the rule does not exist.
    pub async fn update_rule(
        &self,
        id: Uuid,
        update: RuleUpdate,
    ) -> Result<Option<Rule>, RouterError> {
        if update.action.is_some() || update.action_config.is_some() {
            let Some(existing) = self.store.get_rule(id).await? else {
                return Ok(None);
            };
            let action = update.action.unwrap_or(existing.action);
            let config = update
                .action_config
                .as_ref()
                .unwrap_or(&existing.action_config);
            validate_action_config(action, config)?;
        }
        Ok(self.store.update_rule(id, &update).await?)
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<bool, RouterError> {
        Ok(self.store.delete_rule(id).await?)
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, RouterError> {
        Ok(self.store.get_rule(id).await?)
    }

    pub async fn list_rules(&self, enabled_only: bool) -> Result<Vec<Rule>, RouterError> {
        Ok(self.store.list_rules(enabled_only).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses() {
        assert_eq!(bare_address(" Support <support@x.com> "), "support@x.com");
        assert_eq!(bare_address(" team@x.com "), "team@x.com");
        assert_eq!(bare_address("broken <"), "broken <");
    }

    #[test]
    fn expected_errors_become_error_json() {
        let id = Uuid::new_v4();
        let value = process_result_json(Err(RouterError::NotFound { id })).unwrap();
        assert_eq!(value, json!({"error": "Event not found"}));

        let value = process_result_json(Err(RouterError::AlreadyProcessed {
            id,
            status: "processed".into(),
        }))
        .unwrap();
        assert_eq!(value, json!({"error": "Event already processed: processed"}));

        let db = process_result_json(Err(RouterError::Database(DatabaseError::Query("x".into()))));
        assert!(db.is_err());
    }
}
