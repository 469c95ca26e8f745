//! End-to-end routing tests against an in-memory libSQL store.
//!
//! Each test builds the real router, executor, vault and durable queue and
//! drives events through ingestion → routing → action → final status.

use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::TempDir;
use uuid::Uuid;

use substrate::error::{RouterError, SyncError};
use substrate::events::{
    ActionExecutor, ActionStatus, EventRouter, EventSource, EventStatus, NewEvent, NewRule,
    RuleAction, RuleUpdate,
};
use substrate::notes::VaultNotes;
use substrate::store::{Database, LibSqlBackend};
use substrate::worker::periodic::PeriodicState;
use substrate::worker::{DurableQueue, PeriodicTask, backoff_delay};

struct Harness {
    router: Arc<EventRouter>,
    store: Arc<dyn Database>,
    vault: TempDir,
}

async fn harness() -> Harness {
    let vault = tempfile::tempdir().unwrap();
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let executor = Arc::new(ActionExecutor::new(
        Arc::clone(&store),
        Arc::new(VaultNotes::new(vault.path().to_path_buf())),
        Arc::new(DurableQueue::new(Arc::clone(&store))),
    ));
    Harness {
        router: Arc::new(EventRouter::new(Arc::clone(&store), executor)),
        store,
        vault,
    }
}

fn email(to: &str, subject: &str) -> NewEvent {
    NewEvent::new(EventSource::Email, "email.received", json!({}))
        .with_from("alice@example.com")
        .with_to(to)
        .with_subject(subject)
        .with_body("Please help.")
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_tag_rule_processes_event() {
    let h = harness().await;
    let rule = h
        .router
        .create_rule(
            NewRule::new("support", json!({"to_contains": "support@"}), RuleAction::Tag)
                .with_config(json!({"tags": ["support"]}))
                .with_priority(10),
        )
        .await
        .unwrap();
    let event = h
        .router
        .create_event(email("support@x.com", "Help"))
        .await
        .unwrap();

    let route = h.router.route_event(&event).await.unwrap().unwrap();
    assert_eq!(route.rule_id, rule.id);

    let outcome = h.router.process_event(event.id).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Processed);
    assert_eq!(outcome.rule_id, Some(rule.id));

    let stored = h.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
    assert_eq!(stored.matched_rule_id, Some(rule.id));
    assert!(stored.routed_at.is_some());
    let route_result = stored.route_result.unwrap();
    assert_eq!(route_result["tags_added"], json!(["support"]));
    assert_eq!(route_result["rule_name"], "support");

    let rule = h.router.get_rule(rule.id).await.unwrap().unwrap();
    assert_eq!(rule.match_count, 1);
    assert!(rule.last_matched_at.is_some());
}

#[tokio::test]
async fn scenario_b_no_match_is_unmatched() {
    let h = harness().await;
    h.router
        .create_rule(NewRule::new(
            "support",
            json!({"to_contains": "support@"}),
            RuleAction::Ignore,
        ))
        .await
        .unwrap();
    let event = h
        .router
        .create_event(
            NewEvent::new(EventSource::Email, "email.received", json!({})).with_from("x@y.com"),
        )
        .await
        .unwrap();

    let outcome = h.router.process_event(event.id).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Unmatched);
    assert!(outcome.rule_id.is_none());

    let stored = h.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Unmatched);
    assert!(stored.matched_rule_id.is_none());
    assert!(stored.routed_at.is_some());
    assert!(h.store.list_action_logs(event.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_c_higher_priority_wins_regardless_of_creation_order() {
    for high_first in [true, false] {
        let h = harness().await;
        let make = |priority: i64| {
            NewRule::new(
                format!("p{priority}"),
                json!({"subject_contains": "help"}),
                RuleAction::Ignore,
            )
            .with_priority(priority)
        };
        let (first, second) = if high_first { (10, 5) } else { (5, 10) };
        let a = h.router.create_rule(make(first)).await.unwrap();
        let b = h.router.create_rule(make(second)).await.unwrap();
        let high = if high_first { a.id } else { b.id };

        let event = h
            .router
            .create_event(email("team@x.com", "Need help"))
            .await
            .unwrap();
        let outcome = h.router.process_event(event.id).await.unwrap();
        assert_eq!(outcome.rule_id, Some(high));
    }
}

#[tokio::test]
async fn equal_priority_falls_back_to_creation_order() {
    let h = harness().await;
    let first = h
        .router
        .create_rule(NewRule::new("first", json!({}), RuleAction::Ignore))
        .await
        .unwrap();
    h.router
        .create_rule(NewRule::new("second", json!({}), RuleAction::Ignore))
        .await
        .unwrap();
    let event = h
        .router
        .create_event(NewEvent::new(EventSource::Manual, "note", json!({})))
        .await
        .unwrap();
    let outcome = h.router.process_event(event.id).await.unwrap();
    assert_eq!(outcome.rule_id, Some(first.id));
}

#[tokio::test]
async fn scenario_d_spawn_task_without_name_fails_event() {
    let h = harness().await;
    h.router
        .create_rule(NewRule::new(
            "spawn",
            json!({"source_equals": "webhook"}),
            RuleAction::SpawnTask,
        ))
        .await
        .unwrap();
    let event = h
        .router
        .create_event(NewEvent::new(EventSource::Webhook, "github.push", json!({})))
        .await
        .unwrap();

    let outcome = h.router.process_event(event.id).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Failed);
    let result = outcome.action_result.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("No task_name specified"));

    let stored = h.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Failed);

    let logs = h.store.list_action_logs(event.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ActionStatus::Failed);
    assert_eq!(logs[0].error.as_deref(), Some("No task_name specified"));
}

#[test]
fn scenario_e_two_errors_back_off_240s() {
    assert_eq!(backoff_delay(60, 3600, 2), 240);

    let mut state = PeriodicState {
        interval_seconds: 60,
        max_interval_seconds: 3600,
        iteration: 0,
        consecutive_errors: 0,
        last_result: None,
        last_error: None,
    };
    let failure = || SyncError::Transient {
        source_name: "imap".into(),
        reason: "timeout".into(),
    };
    PeriodicTask::advance(&mut state, Err(failure()));
    assert_eq!(PeriodicTask::advance(&mut state, Err(failure())), 240);
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[tokio::test]
async fn already_processed_does_not_mutate() {
    let h = harness().await;
    h.router
        .create_rule(NewRule::new("all", json!({}), RuleAction::Ignore))
        .await
        .unwrap();
    let event = h
        .router
        .create_event(email("a@x.com", "Hi"))
        .await
        .unwrap();
    h.router.process_event(event.id).await.unwrap();
    let before = h.store.get_event(event.id).await.unwrap().unwrap();

    let err = h.router.process_event(event.id).await.unwrap_err();
    assert!(
        matches!(err, RouterError::AlreadyProcessed { ref status, .. } if status == "processed")
    );
    assert_eq!(err.to_string(), "Event already processed: processed");

    let after = h.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.routed_at, before.routed_at);
    assert_eq!(h.store.list_action_logs(event.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_event_is_not_found() {
    let h = harness().await;
    let err = h.router.process_event(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, RouterError::NotFound { .. }));
    let err = h.router.reprocess_event(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, RouterError::NotFound { .. }));
}

#[tokio::test]
async fn reprocess_matches_a_fresh_run_against_current_rules() {
    let h = harness().await;
    let event = h
        .router
        .create_event(email("billing@x.com", "Invoice"))
        .await
        .unwrap();
    let first = h.router.process_event(event.id).await.unwrap();
    assert_eq!(first.status, EventStatus::Unmatched);

    let rule = h
        .router
        .create_rule(
            NewRule::new("billing", json!({"to_equals": "BILLING@x.com"}), RuleAction::Tag)
                .with_config(json!({"tags": ["billing"]})),
        )
        .await
        .unwrap();

    let second = h.router.reprocess_event(event.id).await.unwrap();
    assert_eq!(second.status, EventStatus::Processed);
    assert_eq!(second.rule_id, Some(rule.id));

    // Reprocess again: the previous routing is cleared, not merged.
    h.router
        .update_rule(
            rule.id,
            RuleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let third = h.router.reprocess_event(event.id).await.unwrap();
    assert_eq!(third.status, EventStatus::Unmatched);
    let stored = h.store.get_event(event.id).await.unwrap().unwrap();
    assert!(stored.matched_rule_id.is_none());
    assert!(stored.route_result.is_none());
}

#[tokio::test]
async fn concurrent_processing_runs_action_once() {
    let h = harness().await;
    h.router
        .create_rule(
            NewRule::new("note", json!({}), RuleAction::CreateNote)
                .with_config(json!({"folder": "Inbox", "title_template": "{subject}"})),
        )
        .await
        .unwrap();
    let event = h
        .router
        .create_event(email("a@x.com", "Race"))
        .await
        .unwrap();

    let id = event.id;
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let router = Arc::clone(&h.router);
            tokio::spawn(async move { router.process_event(id).await })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;
    let ok = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(ok, 1);
    assert_eq!(h.store.list_action_logs(event.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn create_note_writes_into_vault() {
    let h = harness().await;
    h.router
        .create_rule(
            NewRule::new("notes", json!({"from_contains": "alice"}), RuleAction::CreateNote)
                .with_config(json!({
                    "folder": "Support",
                    "title_template": "Email: {subject}",
                    "tags": ["email"],
                })),
        )
        .await
        .unwrap();
    let event = h
        .router
        .create_event(email("support@x.com", "Printer on fire"))
        .await
        .unwrap();

    let outcome = h.router.process_event(event.id).await.unwrap();
    let result = outcome.action_result.unwrap();
    assert!(result.success);
    let path = result.detail("note_path").and_then(Value::as_str).unwrap();
    assert!(path.starts_with("Support/"));

    let note = std::fs::read_to_string(h.vault.path().join(path)).unwrap();
    assert!(note.contains("Printer on fire"));
    assert!(note.contains(&event.id.to_string()));
    assert!(note.contains("Please help."));
}

// ── Ingestion ───────────────────────────────────────────────────────────

#[tokio::test]
async fn reingestion_updates_payload_only() {
    let h = harness().await;
    let first = h
        .router
        .create_event(
            NewEvent::new(EventSource::Webhook, "order.created", json!({"v": 1}))
                .with_source_id("order-1"),
        )
        .await
        .unwrap();
    let second = h
        .router
        .create_event(
            NewEvent::new(EventSource::Webhook, "order.created", json!({"v": 2}))
                .with_source_id("order-1"),
        )
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.payload, json!({"v": 2}));
    assert_eq!(
        h.store
            .query_events(&Default::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn owner_resolved_from_first_known_recipient() {
    let h = harness().await;
    h.store.upsert_inbox("billing@x.com", "user-2").await.unwrap();
    h.store.upsert_inbox("support@x.com", "user-1").await.unwrap();

    let event = h
        .router
        .create_event(email(
            "random@x.com, Support <SUPPORT@x.com>, billing@x.com",
            "Hi",
        ))
        .await
        .unwrap();
    assert_eq!(event.owner_id.as_deref(), Some("user-1"));

    let explicit = h
        .router
        .create_event(email("support@x.com", "Hi").with_owner("someone"))
        .await
        .unwrap();
    assert_eq!(explicit.owner_id.as_deref(), Some("someone"));
}

#[tokio::test]
async fn process_pending_sweeps_oldest_first() {
    let h = harness().await;
    h.router
        .create_rule(NewRule::new(
            "hooks",
            json!({"source_equals": "webhook"}),
            RuleAction::Ignore,
        ))
        .await
        .unwrap();
    for i in 0..3 {
        h.router
            .create_event(
                NewEvent::new(EventSource::Webhook, "ping", json!({"i": i}))
                    .with_source_id(format!("ping-{i}")),
            )
            .await
            .unwrap();
    }
    let summary = h.router.process_pending(2).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.processed, 2);

    let summary = h.router.process_pending(100).await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.results[0]["status"], "processed");
}

#[tokio::test]
async fn invalid_rule_config_is_rejected() {
    let h = harness().await;
    let err = h
        .router
        .create_rule(
            NewRule::new("bad", json!({}), RuleAction::Tag).with_config(json!({"tags": "nope"})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Config(_)));
    assert!(h.router.list_rules(false).await.unwrap().is_empty());
}
