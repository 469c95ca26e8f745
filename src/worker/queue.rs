//! Durable task queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::store::Database;
use crate::worker::state::QueuedTask;

/// Spawn side of the task queue, as seen by actions and schedulers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `task_name` on `queue` and return the new task's ID.
    async fn spawn(&self, task_name: &str, params: Value, queue: &str) -> Result<Uuid, QueueError>;

    /// Tasks named `task_name` that are pending, running or sleeping on any queue.
    async fn active_tasks(&self, task_name: &str) -> Result<Vec<QueuedTask>, QueueError>;
}

/// [`TaskQueue`] backed by the `tasks` table.
pub struct DurableQueue {
    store: Arc<dyn Database>,
    /// When set, spawns onto queues outside this list are rejected.
    known_queues: Option<Vec<String>>,
}

impl DurableQueue {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            store,
            known_queues: None,
        }
    }

    /// Only accept spawns onto queues that have a lane.
    pub fn with_known_queues(mut self, queues: Vec<String>) -> Self {
        self.known_queues = Some(queues);
        self
    }
}

#[async_trait]
impl TaskQueue for DurableQueue {
    async fn spawn(&self, task_name: &str, params: Value, queue: &str) -> Result<Uuid, QueueError> {
        if !params.is_object() {
            return Err(QueueError::InvalidParams {
                task_name: task_name.to_string(),
                reason: "params must be a JSON object".into(),
            });
        }
        if let Some(known) = &self.known_queues
            && !known.iter().any(|q| q == queue)
        {
            return Err(QueueError::UnknownQueue(queue.to_string()));
        }

        let task = self.store.enqueue_task(queue, task_name, &params).await?;
        debug!(task_id = %task.id, task_name, queue, "Task spawned");
        Ok(task.id)
    }

    async fn active_tasks(&self, task_name: &str) -> Result<Vec<QueuedTask>, QueueError> {
        Ok(self.store.active_tasks(task_name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn queue() -> (Arc<dyn Database>, DurableQueue) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = DurableQueue::new(Arc::clone(&store))
            .with_known_queues(vec!["default".into(), "email".into()]);
        (store, queue)
    }

    #[tokio::test]
    async fn spawn_persists_pending_task() {
        let (store, queue) = queue().await;
        let id = queue
            .spawn("events.process", json!({"event_id": "e1"}), "default")
            .await
            .unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.task_name, "events.process");
        assert_eq!(task.queue, "default");
        assert_eq!(task.params["event_id"], "e1");
        assert_eq!(queue.active_tasks("events.process").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_non_object_params() {
        let (_, queue) = queue().await;
        let err = queue.spawn("t", json!([1, 2]), "default").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn rejects_unknown_queue() {
        let (_, queue) = queue().await;
        let err = queue.spawn("t", json!({}), "obsidian").await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(q) if q == "obsidian"));
    }
}
