//! Durable task state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// State of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a lane to claim it.
    Pending,
    /// Claimed by a lane and executing.
    Running,
    /// Parked until `eligible_at` (durable sleep).
    Sleeping,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        Self::Pending,
        Self::Running,
        Self::Sleeping,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Pending, Running) |
            (Sleeping, Running) |
            (Running, Completed) | (Running, Failed) | (Running, Sleeping) |
            // Crash recovery requeues work a dead lane left behind
            (Running, Pending)
        )
    }

    /// States that may move to `target`.
    pub fn predecessors(target: TaskState) -> Vec<TaskState> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Pending, running and sleeping tasks count toward singleton checks.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// A row in the durable task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    /// Lane that executes this task.
    pub queue: String,
    pub task_name: String,
    pub params: Value,
    pub state: TaskState,
    /// Earliest time a lane may claim the task.
    pub eligible_at: DateTime<Utc>,
    /// Number of times a lane has claimed the task.
    pub attempts: i64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
