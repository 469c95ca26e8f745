//! Task handler contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;
use crate::worker::state::QueuedTask;

/// What a lane hands to a handler for one execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_name: String,
    pub queue: String,
    pub params: Value,
    /// 1 on the first run, incremented every time the task is claimed.
    pub attempt: i64,
}

impl TaskContext {
    pub fn from_task(task: &QueuedTask) -> Self {
        Self {
            task_id: task.id,
            task_name: task.task_name.clone(),
            queue: task.queue.clone(),
            params: task.params.clone(),
            attempt: task.attempts,
        }
    }

    /// Deserialize params into a typed struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.params.clone()).map_err(|e| TaskError::InvalidParameters {
            name: self.task_name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Result of a single handler run.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Task is done; `Value` is stored as its result.
    Completed(Value),
    /// Park the task until `until`, then run it again with `params`.
    Sleep { until: DateTime<Utc>, params: Value },
}

/// A named unit of background work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Params {
        limit: u32,
    }

    fn ctx(params: Value) -> TaskContext {
        TaskContext {
            task_id: Uuid::new_v4(),
            task_name: "events.process_pending".into(),
            queue: "default".into(),
            params,
            attempt: 1,
        }
    }

    #[test]
    fn typed_params() {
        let p: Params = ctx(json!({"limit": 5})).params().unwrap();
        assert_eq!(p.limit, 5);
    }

    #[test]
    fn bad_params_name_the_task() {
        let err = ctx(json!({"limit": "many"})).params::<Params>().err().unwrap();
        assert!(
            matches!(err, TaskError::InvalidParameters { ref name, .. } if name == "events.process_pending")
        );
    }
}
