//! Error types for Substrate.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Notes error: {0}")]
    Notes(#[from] NotesError),
}

/// Configuration-related errors.
///
/// Also raised for malformed rule definitions (unknown action kind, bad
/// action config) since those are configuration mistakes, not runtime faults.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid action config for {action}: {reason}")]
    InvalidActionConfig { action: String, reason: String },

    #[error("Unknown event source: {0}")]
    UnknownSource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        id: String,
        from: String,
        to: String,
    },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced at the routing boundary.
///
/// `NotFound` and `AlreadyProcessed` are expected outcomes that callers turn
/// into an `{"error": ...}` result; only `Database` indicates a real fault.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Event not found")]
    NotFound { id: Uuid },

    #[error("Event already processed: {status}")]
    AlreadyProcessed { id: Uuid, status: String },

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors raised inside an action handler.
///
/// These never leave the `ActionExecutor`: they are captured as a failed
/// `ActionResult` and written to the action log.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Action {action} failed: {reason}")]
    Failed { action: String, reason: String },

    #[error("Notes error: {0}")]
    Notes(#[from] NotesError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Action handler panicked: {0}")]
    Panicked(String),
}

/// Durable task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid task params for {task_name}: {reason}")]
    InvalidParams { task_name: String, reason: String },

    #[error("No lane serves queue '{0}'")]
    UnknownQueue(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors returned by task handlers running on a lane.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown task: {name}")]
    Unknown { name: String },

    #[error("Duplicate task registration: {name}")]
    Duplicate { name: String },

    #[error("Invalid parameters for task {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Task {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Task {name} panicked: {reason}")]
    Panicked { name: String, reason: String },

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors from one step of a periodic sync loop.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// External API / mailbox failure. Triggers backoff, never termination.
    #[error("Transient sync failure in {source_name}: {reason}")]
    Transient { source_name: String, reason: String },

    #[error("Sync step {step} timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Notes collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum NotesError {
    #[error("Invalid note folder: {0}")]
    InvalidFolder(String),

    #[error("Failed to write note {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
