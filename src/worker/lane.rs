//! Queue lanes.
//!
//! A lane is one long-lived tokio task bound to a queue name. It claims the
//! next eligible task, runs it to completion, records the outcome, and
//! repeats. Lanes share nothing but the store and the frozen registry, so a
//! slow task on one queue never blocks another.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, TaskError};
use crate::store::Database;
use crate::worker::registry::TaskRegistry;
use crate::worker::state::QueuedTask;
use crate::worker::task::{TaskContext, TaskOutcome};

/// Worker for a single queue.
pub struct Lane {
    name: String,
    store: Arc<dyn Database>,
    registry: Arc<TaskRegistry>,
    poll_interval: Duration,
}

impl Lane {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Database>,
        registry: Arc<TaskRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            poll_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until `shutdown` flips to `true`. The current task always
    /// finishes before the lane exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.store.requeue_running_tasks(&self.name).await {
            Ok(0) => {}
            Ok(n) => warn!(lane = %self.name, count = n, "Requeued tasks left running by a previous worker"),
            Err(e) => error!(lane = %self.name, "Failed to requeue running tasks: {e}"),
        }
        info!(lane = %self.name, "Lane started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(lane = %self.name, "Failed to claim task: {e}"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(lane = %self.name, "Lane stopped");
    }

    /// Claim and execute at most one task. Returns whether a task ran.
    pub async fn run_once(&self) -> Result<bool, DatabaseError> {
        let Some(task) = self.store.claim_next_task(&self.name, Utc::now()).await? else {
            return Ok(false);
        };

        debug!(lane = %self.name, task_id = %task.id, task = %task.task_name, attempt = task.attempts, "Running task");
        let outcome = self.execute(&task).await;

        let recorded = match outcome {
            Ok(TaskOutcome::Completed(result)) => {
                debug!(task_id = %task.id, task = %task.task_name, "Task completed");
                self.store.complete_task(task.id, &result).await
            }
            Ok(TaskOutcome::Sleep { until, params }) => {
                debug!(task_id = %task.id, task = %task.task_name, until = %until, "Task sleeping");
                self.store.sleep_task(task.id, until, &params).await
            }
            Err(e) => {
                warn!(task_id = %task.id, task = %task.task_name, "Task failed: {e}");
                self.store.fail_task(task.id, &e.to_string()).await
            }
        };

        if let Err(e) = recorded {
            error!(task_id = %task.id, "Failed to record task outcome: {e}");
        }
        Ok(true)
    }

    async fn execute(&self, task: &QueuedTask) -> Result<TaskOutcome, TaskError> {
        let Some(handler) = self.registry.get(&task.task_name) else {
            return Err(TaskError::Unknown {
                name: task.task_name.clone(),
            });
        };

        let ctx = TaskContext::from_task(task);
        match AssertUnwindSafe(handler.run(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(TaskError::Panicked {
                name: task.task_name.clone(),
                reason: panic_message(panic.as_ref()),
            }),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Running lanes plus their shutdown signal.
pub struct LaneSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl LaneSet {
    /// Start one lane per queue name.
    pub fn start(
        queues: &[String],
        store: Arc<dyn Database>,
        registry: Arc<TaskRegistry>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = queues
            .iter()
            .map(|queue| {
                let lane = Lane::new(
                    queue.clone(),
                    Arc::clone(&store),
                    Arc::clone(&registry),
                    poll_interval,
                );
                (queue.clone(), tokio::spawn(lane.run(rx.clone())))
            })
            .collect();
        Self { shutdown, handles }
    }

    pub fn queues(&self) -> Vec<&str> {
        self.handles.iter().map(|(q, _)| q.as_str()).collect()
    }

    /// Signal every lane and wait for them to finish their current task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let (names, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        for (name, joined) in names.iter().zip(futures::future::join_all(handles).await) {
            if let Err(e) = joined {
                error!(lane = %name, "Lane task ended abnormally: {e}");
            }
        }
    }
}
