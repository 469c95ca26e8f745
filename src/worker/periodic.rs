//! Self-rescheduling periodic sync tasks.
//!
//! A periodic task runs one [`SyncStep`] per execution and then parks itself
//! with a future eligibility time. Its loop state travels in the task params,
//! so a restart resumes with the same iteration count and backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{SyncError, TaskError};
use crate::worker::task::{TaskContext, TaskHandler, TaskOutcome};

/// Longest single durable sleep.
const MAX_SLEEP_SECS: u64 = 30 * 24 * 3600;

/// One iteration of a sync loop.
#[async_trait]
pub trait SyncStep: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Run once and return a JSON summary.
    async fn run_once(&self) -> Result<Value, SyncError>;
}

/// `min(base * 2^errors, max)`, saturating.
pub fn backoff_delay(base_secs: u64, max_secs: u64, consecutive_errors: u32) -> u64 {
    let factor = 1u64.checked_shl(consecutive_errors).unwrap_or(u64::MAX);
    base_secs.saturating_mul(factor).min(max_secs)
}

/// Loop state persisted in the task params between iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicState {
    pub interval_seconds: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_seconds: u64,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_max_interval() -> u64 {
    3600
}

/// Task handler driving a [`SyncStep`] forever with adaptive backoff.
pub struct PeriodicTask {
    step: Arc<dyn SyncStep>,
    default_interval: u64,
    default_max_interval: u64,
    step_timeout: Duration,
}

impl PeriodicTask {
    pub fn new(step: Arc<dyn SyncStep>, default_interval: u64, default_max_interval: u64) -> Self {
        Self {
            step,
            default_interval,
            default_max_interval,
            step_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    fn state_from(&self, params: &Value) -> PeriodicState {
        let mut state = PeriodicState {
            interval_seconds: self.default_interval,
            max_interval_seconds: self.default_max_interval,
            iteration: 0,
            consecutive_errors: 0,
            last_result: None,
            last_error: None,
        };
        let get = |key: &str| params.get(key).and_then(Value::as_u64);
        if let Some(v) = get("interval_seconds") {
            state.interval_seconds = v;
        }
        if let Some(v) = get("max_interval_seconds") {
            state.max_interval_seconds = v;
        }
        if let Some(v) = get("iteration") {
            state.iteration = v;
        }
        if let Some(v) = get("consecutive_errors") {
            state.consecutive_errors = u32::try_from(v).unwrap_or(u32::MAX);
        }
        state
    }

    /// Apply one step result to the loop state and return the delay.
    pub fn advance(state: &mut PeriodicState, result: Result<Value, SyncError>) -> u64 {
        match result {
            Ok(summary) => {
                state.consecutive_errors = 0;
                state.last_result = Some(summary);
                state.last_error = None;
                state.interval_seconds
            }
            Err(e) => {
                state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                state.last_error = Some(e.to_string());
                backoff_delay(
                    state.interval_seconds,
                    state.max_interval_seconds,
                    state.consecutive_errors,
                )
            }
        }
    }
}

#[async_trait]
impl TaskHandler for PeriodicTask {
    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let mut state = self.state_from(&ctx.params);
        state.iteration += 1;

        let result = match tokio::time::timeout(self.step_timeout, self.step.run_once()).await {
            Ok(r) => r,
            Err(_) => Err(SyncError::Timeout {
                step: self.step.name().to_string(),
                timeout: self.step_timeout,
            }),
        };

        let delay = Self::advance(&mut state, result);
        match &state.last_error {
            Some(error) => warn!(
                task = %ctx.task_name,
                iteration = state.iteration,
                consecutive_errors = state.consecutive_errors,
                delay_secs = delay,
                "Sync step failed, backing off: {error}"
            ),
            None => info!(
                task = %ctx.task_name,
                iteration = state.iteration,
                delay_secs = delay,
                "Sync step complete"
            ),
        }

        let params = serde_json::to_value(&state).map_err(|e| TaskError::Failed {
            name: ctx.task_name.clone(),
            reason: format!("serialize loop state: {e}"),
        })?;
        let until = Utc::now() + chrono::Duration::seconds(delay.min(MAX_SLEEP_SECS) as i64);

        Ok(TaskOutcome::Sleep { until, params })
    }
}
