//! Worker wiring tests: registry, schedulers and lanes over the durable
//! queue, driven the way the worker binary assembles them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use substrate::events::{
    ActionExecutor, EventRouter, EventSource, EventStatus, EventTasks, NewEvent, NewRule,
    RuleAction,
};
use substrate::notes::VaultNotes;
use substrate::store::{Database, LibSqlBackend};
use substrate::worker::{
    DurableQueue, Lane, LaneSet, Scheduler, SchedulerSource, SpawnReport, TaskQueue,
    TaskRegistry, TaskState,
};

struct Worker {
    store: Arc<dyn Database>,
    router: Arc<EventRouter>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
    event_tasks: EventTasks,
    _vault: TempDir,
}

async fn worker() -> Worker {
    let vault = tempfile::tempdir().unwrap();
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let queue: Arc<dyn TaskQueue> = Arc::new(
        DurableQueue::new(Arc::clone(&store))
            .with_known_queues(vec!["default".into(), "email".into()]),
    );
    let executor = Arc::new(ActionExecutor::new(
        Arc::clone(&store),
        Arc::new(VaultNotes::new(vault.path().to_path_buf())),
        Arc::clone(&queue),
    ));
    let router = Arc::new(EventRouter::new(Arc::clone(&store), executor));
    let event_tasks = EventTasks::new(Arc::clone(&router), 60);

    let mut builder = TaskRegistry::builder();
    builder.register_source(&event_tasks).unwrap();

    Worker {
        store,
        router,
        queue,
        registry: Arc::new(builder.build()),
        event_tasks,
        _vault: vault,
    }
}

fn lane(w: &Worker, queue: &str) -> Lane {
    Lane::new(
        queue,
        Arc::clone(&w.store),
        Arc::clone(&w.registry),
        Duration::from_millis(10),
    )
}

#[tokio::test]
async fn singleton_scheduler_spawns_once() {
    let w = worker().await;
    let scheduler = Scheduler::new(Arc::clone(&w.queue), Arc::clone(&w.registry));
    let sources: [&dyn SchedulerSource; 1] = [&w.event_tasks];
    let descriptors = Scheduler::discover(&sources);

    let first = scheduler.spawn_all(&descriptors).await;
    let Ok(SpawnReport::Spawned { task_id }) = &first[0].1 else {
        panic!("expected spawn, got {:?}", first[0].1);
    };

    let second = scheduler.spawn_all(&descriptors).await;
    assert_eq!(
        second[0].1.as_ref().unwrap(),
        &SpawnReport::AlreadyRunning { task_id: *task_id }
    );
    assert_eq!(w.queue.active_tasks("events.scheduler").await.unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_scheduler_routes_pending_and_sleeps() {
    let w = worker().await;
    w.router
        .create_rule(NewRule::new(
            "hooks",
            json!({"source_equals": "webhook"}),
            RuleAction::Ignore,
        ))
        .await
        .unwrap();
    let event = w
        .router
        .create_event(NewEvent::new(EventSource::Webhook, "ping", json!({})))
        .await
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&w.queue), Arc::clone(&w.registry));
    let report = scheduler.spawn(&w.event_tasks.schedulers()[0]).await.unwrap();
    let SpawnReport::Spawned { task_id } = report else {
        panic!("expected spawn");
    };

    assert!(lane(&w, "default").run_once().await.unwrap());

    let stored = w.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Processed);

    let task = w.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Sleeping);
    assert_eq!(task.params["iteration"], 1);
    assert_eq!(task.params["last_result"]["processed"], 1);
    assert!(task.eligible_at > Utc::now() + chrono::Duration::seconds(50));

    // Still active while sleeping, so a restart does not duplicate it.
    let again = scheduler.spawn(&w.event_tasks.schedulers()[0]).await.unwrap();
    assert_eq!(again, SpawnReport::AlreadyRunning { task_id });
}

#[tokio::test]
async fn spawn_task_action_enqueues_work_for_a_lane() {
    let w = worker().await;
    w.router
        .create_rule(
            NewRule::new(
                "sweep on webhook",
                json!({"event_type_equals": "batch.ready"}),
                RuleAction::SpawnTask,
            )
            .with_config(json!({
                "task_name": "events.process_pending",
                "task_params": {"limit": 10},
            })),
        )
        .await
        .unwrap();
    let trigger = w
        .router
        .create_event(NewEvent::new(EventSource::Webhook, "batch.ready", json!({})))
        .await
        .unwrap();

    let outcome = w.router.process_event(trigger.id).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Processed);
    let task_id = outcome.action_result.unwrap().detail("task_id").cloned().unwrap();

    let queued = w
        .store
        .get_task(task_id.as_str().unwrap().parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queued.queue, "default");
    assert_eq!(queued.params["limit"], 10);
    assert_eq!(queued.params["event_id"], trigger.id.to_string());
    assert_eq!(queued.params["event"]["event_type"], "batch.ready");

    assert!(lane(&w, "default").run_once().await.unwrap());
    let done = w.store.get_task(queued.id).await.unwrap().unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.result.unwrap()["total"], 0);
}

#[tokio::test]
async fn spawn_task_to_unknown_queue_fails_the_event() {
    let w = worker().await;
    w.router
        .create_rule(
            NewRule::new("elsewhere", json!({}), RuleAction::SpawnTask).with_config(json!({
                "task_name": "events.process_pending",
                "queue": "nowhere",
            })),
        )
        .await
        .unwrap();
    let event = w
        .router
        .create_event(NewEvent::new(EventSource::Manual, "note", json!({})))
        .await
        .unwrap();

    let outcome = w.router.process_event(event.id).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Failed);
    let error = outcome.action_result.unwrap().error.unwrap();
    assert!(error.starts_with("Failed to spawn task:"));
}

#[tokio::test]
async fn restarted_lane_resumes_interrupted_task() {
    let w = worker().await;
    let event = w
        .router
        .create_event(NewEvent::new(EventSource::Manual, "note", json!({})))
        .await
        .unwrap();
    let task_id = w
        .queue
        .spawn("events.process", json!({"event_id": event.id}), "default")
        .await
        .unwrap();

    // Simulate a worker that claimed the task and died.
    let claimed = w.store.claim_next_task("default", Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, task_id);
    assert_eq!(claimed.state, TaskState::Running);

    let lanes = LaneSet::start(
        &["default".to_string()],
        Arc::clone(&w.store),
        Arc::clone(&w.registry),
        Duration::from_millis(10),
    );
    let mut state = TaskState::Running;
    for _ in 0..200 {
        state = w.store.get_task(task_id).await.unwrap().unwrap().state;
        if state == TaskState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    lanes.shutdown().await;

    assert_eq!(state, TaskState::Completed);
    let task = w.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.result.unwrap()["status"], "unmatched");
    assert_eq!(task.attempts, 2);
}
