//! Worker system: durable task queue, lanes and periodic schedulers.
//!
//! Core components:
//! - `state`: Task state machine (pending → running → completed/failed, sleeping)
//! - `queue`: `TaskQueue` spawn interface over the `tasks` table
//! - `task`: `TaskHandler` contract and per-run context
//! - `registry`: Immutable task name → handler map, built at startup
//! - `lane`: One worker loop per queue name
//! - `periodic`: Self-rescheduling sync tasks with exponential backoff
//! - `scheduler`: Singleton-aware spawning of periodic task descriptors

pub mod lane;
pub mod periodic;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod task;

pub use lane::{Lane, LaneSet};
pub use periodic::{PeriodicTask, SyncStep, backoff_delay};
pub use queue::{DurableQueue, TaskQueue};
pub use registry::{TaskRegistry, TaskRegistryBuilder, TaskSource};
pub use scheduler::{Scheduler, SchedulerDescriptor, SchedulerSource, SpawnReport};
pub use state::{QueuedTask, TaskState};
pub use task::{TaskContext, TaskHandler, TaskOutcome};
