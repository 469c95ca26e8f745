//! Event-domain background tasks.
//!
//! - `events.process`: route one event by id
//! - `events.process_pending`: sweep a batch of pending events
//! - `events.scheduler`: periodic wrapper around the pending sweep

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{SyncError, TaskError};
use crate::events::router::{EventRouter, process_result_json};
use crate::worker::{
    PeriodicTask, SchedulerDescriptor, SchedulerSource, SyncStep, TaskContext, TaskHandler,
    TaskOutcome, TaskRegistryBuilder, TaskSource,
};

pub const PROCESS_TASK: &str = "events.process";
pub const PROCESS_PENDING_TASK: &str = "events.process_pending";
pub const SCHEDULER_TASK: &str = "events.scheduler";

const DEFAULT_PENDING_LIMIT: u32 = 100;
const MAX_SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Deserialize)]
struct ProcessParams {
    event_id: Uuid,
}

#[derive(Deserialize)]
struct PendingParams {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_PENDING_LIMIT
}

struct ProcessEventTask {
    router: Arc<EventRouter>,
}

#[async_trait]
impl TaskHandler for ProcessEventTask {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let params: ProcessParams = ctx.params()?;
        let result = self.router.process_event(params.event_id).await;
        let value = process_result_json(result)?;
        Ok(TaskOutcome::Completed(value))
    }
}

struct ProcessPendingTask {
    router: Arc<EventRouter>,
}

#[async_trait]
impl TaskHandler for ProcessPendingTask {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let params: PendingParams = ctx.params()?;
        let summary = self.router.process_pending(params.limit).await?;
        let value = serde_json::to_value(&summary).map_err(|e| TaskError::Failed {
            name: ctx.task_name.clone(),
            reason: e.to_string(),
        })?;
        Ok(TaskOutcome::Completed(value))
    }
}

/// One pending sweep per periodic iteration.
pub struct PendingSweep {
    router: Arc<EventRouter>,
    limit: u32,
}

impl PendingSweep {
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self {
            router,
            limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

#[async_trait]
impl SyncStep for PendingSweep {
    fn name(&self) -> &str {
        "pending_sweep"
    }

    async fn run_once(&self) -> Result<Value, SyncError> {
        let summary = self.router.process_pending(self.limit).await.map_err(|e| {
            SyncError::Transient {
                source_name: "events".into(),
                reason: e.to_string(),
            }
        })?;
        Ok(json!({
            "total": summary.total,
            "processed": summary.processed,
            "unmatched": summary.unmatched,
            "failed": summary.failed,
        }))
    }
}

/// Registers the event tasks and declares the sweep scheduler.
pub struct EventTasks {
    router: Arc<EventRouter>,
    sweep_interval_secs: u64,
}

impl EventTasks {
    /// `sweep_interval_secs == 0` disables the sweep scheduler.
    pub fn new(router: Arc<EventRouter>, sweep_interval_secs: u64) -> Self {
        Self {
            router,
            sweep_interval_secs,
        }
    }
}

impl TaskSource for EventTasks {
    fn register_tasks(&self, registry: &mut TaskRegistryBuilder) -> Result<(), TaskError> {
        registry
            .register(
                PROCESS_TASK,
                Arc::new(ProcessEventTask {
                    router: Arc::clone(&self.router),
                }),
            )?
            .register(
                PROCESS_PENDING_TASK,
                Arc::new(ProcessPendingTask {
                    router: Arc::clone(&self.router),
                }),
            )?
            .register(
                SCHEDULER_TASK,
                Arc::new(PeriodicTask::new(
                    Arc::new(PendingSweep::new(Arc::clone(&self.router))),
                    self.sweep_interval_secs.max(1),
                    MAX_SWEEP_INTERVAL_SECS.max(self.sweep_interval_secs),
                )),
            )?;
        Ok(())
    }
}

impl SchedulerSource for EventTasks {
    fn schedulers(&self) -> Vec<SchedulerDescriptor> {
        vec![
            SchedulerDescriptor::new(
                SCHEDULER_TASK,
                "default",
                json!({
                    "interval_seconds": self.sweep_interval_secs,
                    "max_interval_seconds": MAX_SWEEP_INTERVAL_SECS.max(self.sweep_interval_secs),
                }),
            )
            .enabled(self.sweep_interval_secs > 0),
        ]
    }
}
