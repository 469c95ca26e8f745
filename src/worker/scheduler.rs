//! Periodic task scheduling.
//!
//! Collaborators declare long-running periodic tasks through
//! [`SchedulerSource`]. At startup the [`Scheduler`] spawns each enabled
//! descriptor onto its queue, skipping singletons that already have an
//! active instance on any lane.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;
use crate::worker::queue::TaskQueue;
use crate::worker::registry::TaskRegistry;

/// Declaration of a periodic task. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerDescriptor {
    pub task_name: String,
    pub queue: String,
    pub params: Value,
    /// At most one active instance across all lanes.
    pub singleton: bool,
    pub enabled: bool,
}

impl SchedulerDescriptor {
    pub fn new(task_name: impl Into<String>, queue: impl Into<String>, params: Value) -> Self {
        Self {
            task_name: task_name.into(),
            queue: queue.into(),
            params,
            singleton: true,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }
}

/// A collaborator that declares periodic tasks.
pub trait SchedulerSource {
    fn schedulers(&self) -> Vec<SchedulerDescriptor>;
}

/// Outcome of spawning one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SpawnReport {
    Spawned { task_id: Uuid },
    AlreadyRunning { task_id: Uuid },
    Disabled,
}

impl SpawnReport {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Spawned { .. } => "spawned",
            Self::AlreadyRunning { .. } => "already_running",
            Self::Disabled => "disabled",
        }
    }
}

/// Spawns periodic tasks declared by collaborators.
pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, registry: Arc<TaskRegistry>) -> Self {
        Self { queue, registry }
    }

    /// Collect descriptors from every source, in source order.
    pub fn discover(sources: &[&dyn SchedulerSource]) -> Vec<SchedulerDescriptor> {
        sources.iter().flat_map(|s| s.schedulers()).collect()
    }

    /// Spawn a single descriptor, honoring `enabled` and `singleton`.
    pub async fn spawn(&self, descriptor: &SchedulerDescriptor) -> Result<SpawnReport, TaskError> {
        if !descriptor.enabled {
            return Ok(SpawnReport::Disabled);
        }
        if !self.registry.contains(&descriptor.task_name) {
            return Err(TaskError::Unknown {
                name: descriptor.task_name.clone(),
            });
        }

        if descriptor.singleton {
            let active = self.queue.active_tasks(&descriptor.task_name).await?;
            if let Some(existing) = active.first() {
                return Ok(SpawnReport::AlreadyRunning {
                    task_id: existing.id,
                });
            }
        }

        let task_id = self
            .queue
            .spawn(
                &descriptor.task_name,
                descriptor.params.clone(),
                &descriptor.queue,
            )
            .await?;
        Ok(SpawnReport::Spawned { task_id })
    }

    /// Spawn every descriptor. One failure never blocks the others.
    pub async fn spawn_all(
        &self,
        descriptors: &[SchedulerDescriptor],
    ) -> Vec<(SchedulerDescriptor, Result<SpawnReport, TaskError>)> {
        let mut results = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let result = self.spawn(descriptor).await;
            match &result {
                Ok(report) => tracing::info!(
                    task = %descriptor.task_name,
                    queue = %descriptor.queue,
                    result = report.label(),
                    "Scheduler"
                ),
                Err(e) => tracing::error!(
                    task = %descriptor.task_name,
                    queue = %descriptor.queue,
                    "Failed to spawn scheduler: {e}"
                ),
            }
            results.push((descriptor.clone(), result));
        }
        results
    }
}
