//! Mail → event ingestion.
//!
//! Each sync turns new mail into `email` / `email.received` events keyed by
//! Message-ID, then routes the ones still pending. A message is acknowledged
//! to the mail source only after its event is stored.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{RouterError, SyncError, TaskError};
use crate::events::{EventRouter, EventSource, EventStatus, NewEvent};
use crate::integrations::email::{FetchedMail, MailSource, ReceivedEmail};
use crate::worker::{
    PeriodicTask, SchedulerDescriptor, SchedulerSource, SyncStep, TaskContext, TaskHandler,
    TaskOutcome, TaskRegistryBuilder, TaskSource,
};

pub const SYNC_TASK: &str = "email.sync";
pub const SCHEDULER_TASK: &str = "email.scheduler";
pub const EMAIL_QUEUE: &str = "email";

pub const EVENT_TYPE: &str = "email.received";

/// Build the event for one received message.
pub fn email_event(email: &ReceivedEmail) -> NewEvent {
    let payload = json!({
        "message_id": email.message_id,
        "from": email.from,
        "to": email.to,
        "subject": email.subject,
        "date": email.date.map(|d| d.to_rfc3339()),
        "attachments": email.attachments,
    });
    let mut event = NewEvent::new(EventSource::Email, EVENT_TYPE, payload)
        .with_from(email.from.clone())
        .with_to(email.to.clone())
        .with_subject(email.subject.clone())
        .with_body(email.body.clone());
    if let Some(id) = &email.message_id {
        event = event.with_source_id(id.clone());
    }
    if let Some(date) = email.date {
        event = event.with_date(date);
    }
    event
}

pub struct EmailSync {
    source: Arc<dyn MailSource>,
    router: Arc<EventRouter>,
}

impl EmailSync {
    pub fn new(source: Arc<dyn MailSource>, router: Arc<EventRouter>) -> Self {
        Self { source, router }
    }

    fn store_failure(&self, e: RouterError) -> SyncError {
        match e {
            RouterError::Database(e) => SyncError::Database(e),
            other => SyncError::Transient {
                source_name: self.source.name().to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Acknowledge stored messages. A failed acknowledgement only means the
    /// messages are fetched again and deduplicated by Message-ID.
    async fn acknowledge(&self, uids: &[u32]) -> usize {
        if uids.is_empty() {
            return 0;
        }
        match self.source.mark_seen(uids).await {
            Ok(()) => uids.len(),
            Err(e) => {
                warn!(count = uids.len(), "Failed to acknowledge stored mail: {e}");
                0
            }
        }
    }
}

#[async_trait]
impl SyncStep for EmailSync {
    fn name(&self) -> &str {
        "email_sync"
    }

    async fn run_once(&self) -> Result<Value, SyncError> {
        let messages = self.source.fetch_new().await?;

        let mut stored: Vec<u32> = Vec::with_capacity(messages.len());
        let mut processed = 0usize;
        let mut unmatched = 0usize;
        let mut failed = 0usize;
        let mut store_error = None;

        for FetchedMail { uid, email } in &messages {
            let event = match self.router.create_event(email_event(email)).await {
                Ok(event) => event,
                Err(e) => {
                    store_error = Some(self.store_failure(e));
                    break;
                }
            };
            stored.push(*uid);

            if event.status != EventStatus::Pending {
                continue;
            }
            match self.router.process_event(event.id).await {
                Ok(outcome) => match outcome.status {
                    EventStatus::Processed => processed += 1,
                    EventStatus::Unmatched => unmatched += 1,
                    _ => failed += 1,
                },
                Err(RouterError::AlreadyProcessed { .. }) => {}
                Err(e) => {
                    failed += 1;
                    warn!(event_id = %event.id, "Failed to route email event: {e}");
                }
            }
        }

        let acknowledged = self.acknowledge(&stored).await;
        if let Some(e) = store_error {
            warn!(
                fetched = messages.len(),
                ingested = stored.len(),
                "Email sync stopped on store failure: {e}"
            );
            return Err(e);
        }

        if !messages.is_empty() {
            info!(
                fetched = messages.len(),
                processed, unmatched, failed, "Email sync complete"
            );
        }
        Ok(json!({
            "fetched": messages.len(),
            "ingested": stored.len(),
            "acknowledged": acknowledged,
            "processed": processed,
            "unmatched": unmatched,
            "failed": failed,
        }))
    }
}

/// One-shot run of the sync step.
struct SyncOnce {
    step: Arc<EmailSync>,
}

#[async_trait]
impl TaskHandler for SyncOnce {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let summary = self.step.run_once().await.map_err(|e| TaskError::Failed {
            name: ctx.task_name.clone(),
            reason: e.to_string(),
        })?;
        Ok(TaskOutcome::Completed(summary))
    }
}

/// Registers the email tasks. Without a mail source nothing is registered
/// and the scheduler is declared disabled.
pub struct EmailTasks {
    sync: Option<Arc<EmailSync>>,
    poll_interval_secs: u64,
    max_poll_interval_secs: u64,
}

impl EmailTasks {
    pub fn new(sync: Option<Arc<EmailSync>>) -> Self {
        Self {
            sync,
            poll_interval_secs: 60,
            max_poll_interval_secs: 3600,
        }
    }

    pub fn with_intervals(mut self, poll_secs: u64, max_secs: u64) -> Self {
        self.poll_interval_secs = poll_secs;
        self.max_poll_interval_secs = max_secs;
        self
    }
}

impl TaskSource for EmailTasks {
    fn register_tasks(&self, registry: &mut TaskRegistryBuilder) -> Result<(), TaskError> {
        let Some(sync) = &self.sync else {
            return Ok(());
        };
        registry
            .register(
                SYNC_TASK,
                Arc::new(SyncOnce {
                    step: Arc::clone(sync),
                }),
            )?
            .register(
                SCHEDULER_TASK,
                Arc::new(PeriodicTask::new(
                    Arc::clone(sync) as Arc<dyn SyncStep>,
                    self.poll_interval_secs.max(1),
                    self.max_poll_interval_secs,
                )),
            )?;
        Ok(())
    }
}

impl SchedulerSource for EmailTasks {
    fn schedulers(&self) -> Vec<SchedulerDescriptor> {
        vec![
            SchedulerDescriptor::new(
                SCHEDULER_TASK,
                EMAIL_QUEUE,
                json!({
                    "interval_seconds": self.poll_interval_secs,
                    "max_interval_seconds": self.max_poll_interval_secs,
                }),
            )
            .enabled(self.sync.is_some()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ActionExecutor, NewRule, RuleAction};
    use crate::integrations::email::AttachmentInfo;
    use crate::notes::VaultNotes;
    use crate::store::{Database, LibSqlBackend};
    use crate::worker::DurableQueue;
    use chrono::{TimeZone, Utc};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// In-memory mailbox: fetch returns every unacknowledged message.
    #[derive(Default)]
    struct FakeMailbox {
        messages: Mutex<Vec<FetchedMail>>,
        seen: Mutex<Vec<u32>>,
        fetch_error: Mutex<Option<SyncError>>,
        reject_acks: bool,
    }

    #[async_trait]
    impl MailSource for FakeMailbox {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch_new(&self) -> Result<Vec<FetchedMail>, SyncError> {
            if let Some(e) = self.fetch_error.lock().unwrap().take() {
                return Err(e);
            }
            let seen = self.seen.lock().unwrap();
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| !seen.contains(&m.uid))
                .cloned()
                .collect())
        }

        async fn mark_seen(&self, uids: &[u32]) -> Result<(), SyncError> {
            if self.reject_acks {
                return Err(SyncError::Transient {
                    source_name: "fake".into(),
                    reason: "store rejected".into(),
                });
            }
            self.seen.lock().unwrap().extend_from_slice(uids);
            Ok(())
        }
    }

    fn mail(id: &str, subject: &str) -> ReceivedEmail {
        ReceivedEmail {
            message_id: Some(id.into()),
            from: "alice@example.com".into(),
            to: "support@example.com".into(),
            subject: subject.into(),
            body: "hello".into(),
            date: Some(Utc.with_ymd_and_hms(2025, 7, 1, 8, 30, 0).unwrap()),
            attachments: vec![AttachmentInfo {
                filename: "a.pdf".into(),
                content_type: "application/pdf".into(),
                size: 3,
            }],
        }
    }

    fn mailbox(messages: Vec<ReceivedEmail>) -> FakeMailbox {
        FakeMailbox {
            messages: Mutex::new(
                messages
                    .into_iter()
                    .zip(1..)
                    .map(|(email, uid)| FetchedMail { uid, email })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    struct Harness {
        sync: EmailSync,
        store: Arc<dyn Database>,
        mailbox: Arc<FakeMailbox>,
        db_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn setup(mailbox: FakeMailbox) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("substrate.db");
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&db_path).await.unwrap());
        let executor = Arc::new(ActionExecutor::new(
            Arc::clone(&store),
            Arc::new(VaultNotes::new(dir.path().join("vault"))),
            Arc::new(DurableQueue::new(Arc::clone(&store))),
        ));
        let router = Arc::new(EventRouter::new(Arc::clone(&store), executor));
        router
            .create_rule(
                NewRule::new(
                    "tag invoices",
                    json!({"subject_contains": "invoice"}),
                    RuleAction::Tag,
                )
                .with_config(json!({"tags": ["billing"]})),
            )
            .await
            .unwrap();
        let mailbox = Arc::new(mailbox);
        Harness {
            sync: EmailSync::new(Arc::clone(&mailbox) as Arc<dyn MailSource>, router),
            store,
            mailbox,
            db_path,
            _dir: dir,
        }
    }

    /// Run SQL against the harness database through a second connection.
    async fn exec_sql(path: &Path, sql: &str) {
        let db = libsql::Builder::new_local(path).build().await.unwrap();
        db.connect().unwrap().execute_batch(sql).await.unwrap();
    }

    #[test]
    fn email_event_carries_headers() {
        let event = email_event(&mail("m1", "Hi"));
        assert_eq!(event.source, EventSource::Email);
        assert_eq!(event.event_type, EVENT_TYPE);
        assert_eq!(event.source_id.as_deref(), Some("m1"));
        assert_eq!(event.email_from.as_deref(), Some("alice@example.com"));
        assert_eq!(event.payload["attachments"][0]["filename"], "a.pdf");
    }

    #[tokio::test]
    async fn sync_ingests_routes_and_acknowledges() {
        let h = setup(mailbox(vec![mail("m1", "Invoice #1"), mail("m2", "Lunch?")])).await;

        let summary = h.sync.run_once().await.unwrap();
        assert_eq!(summary["fetched"], 2);
        assert_eq!(summary["acknowledged"], 2);
        assert_eq!(summary["processed"], 1);
        assert_eq!(summary["unmatched"], 1);
        assert_eq!(*h.mailbox.seen.lock().unwrap(), vec![1, 2]);

        let events = h.store.query_events(&Default::default()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.status.is_terminal()));

        let again = h.sync.run_once().await.unwrap();
        assert_eq!(again["fetched"], 0);
    }

    #[tokio::test]
    async fn store_failure_leaves_unsaved_mail_unacknowledged() {
        let h = setup(mailbox(vec![
            mail("m1", "Invoice #1"),
            mail("m2", "Invoice #2"),
            mail("m3", "Invoice #3"),
        ]))
        .await;
        exec_sql(
            &h.db_path,
            "CREATE TRIGGER reject_m2 BEFORE INSERT ON events WHEN NEW.source_id = 'm2' \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .await;

        let err = h.sync.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Database(_)));
        assert_eq!(*h.mailbox.seen.lock().unwrap(), vec![1]);
        assert_eq!(h.store.query_events(&Default::default()).await.unwrap().len(), 1);

        exec_sql(&h.db_path, "DROP TRIGGER reject_m2;").await;
        let summary = h.sync.run_once().await.unwrap();
        assert_eq!(summary["fetched"], 2);
        assert_eq!(summary["processed"], 2);
        assert_eq!(*h.mailbox.seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(h.store.query_events(&Default::default()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unacknowledged_message_is_not_routed_twice() {
        let h = setup(FakeMailbox {
            reject_acks: true,
            ..mailbox(vec![mail("m1", "Invoice #1")])
        })
        .await;

        let first = h.sync.run_once().await.unwrap();
        assert_eq!(first["acknowledged"], 0);
        let second = h.sync.run_once().await.unwrap();
        assert_eq!(second["ingested"], 1);
        assert_eq!(second["processed"], 0);

        let events = h.store.query_events(&Default::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        let logs = h.store.list_action_logs(events[0].id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_transient() {
        let h = setup(FakeMailbox {
            fetch_error: Mutex::new(Some(SyncError::Transient {
                source_name: "fake".into(),
                reason: "connection refused".into(),
            })),
            ..Default::default()
        })
        .await;
        let err = h.sync.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Transient { .. }));
    }

    #[test]
    fn scheduler_disabled_without_source() {
        let tasks = EmailTasks::new(None);
        let descriptors = tasks.schedulers();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].queue, EMAIL_QUEUE);
        assert!(!descriptors[0].enabled);

        let mut builder = crate::worker::TaskRegistry::builder();
        builder.register_source(&tasks).unwrap();
        assert!(builder.build().is_empty());
    }

    #[tokio::test]
    async fn registers_sync_and_scheduler() {
        let h = setup(FakeMailbox::default()).await;
        let tasks = EmailTasks::new(Some(Arc::new(h.sync))).with_intervals(30, 600);
        let descriptors = tasks.schedulers();
        assert!(descriptors[0].enabled && descriptors[0].singleton);
        assert_eq!(descriptors[0].params["interval_seconds"], 30);

        let mut builder = crate::worker::TaskRegistry::builder();
        builder.register_source(&tasks).unwrap();
        let registry = builder.build();
        assert_eq!(registry.names(), vec![SCHEDULER_TASK, SYNC_TASK]);
    }
}
