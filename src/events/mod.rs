//! Event ingestion, rule routing and action execution.
//!
//! - `model`: events, rules, action logs and their lifecycle enums
//! - `matcher`: pure condition evaluation
//! - `router`: claim, first-match routing and status finalization
//! - `actions`: the closed set of rule actions plus the audit log
//! - `tasks`: background task handlers for routing

pub mod actions;
pub mod matcher;
pub mod model;
pub mod router;
pub mod tasks;

pub use actions::{ActionExecutor, validate_action_config};
pub use matcher::{event_summary, matches_conditions};
pub use model::{
    ActionLog, ActionResult, ActionStatus, Event, EventQuery, EventSource, EventStatus, NewEvent,
    NewRule, ProcessOutcome, RouteMatch, Rule, RuleAction, RuleUpdate,
};
pub use router::{EventRouter, PendingSummary, process_result_json, select_rule};
pub use tasks::EventTasks;
