//! HTTP ingestion and administration endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::RouterError;
use crate::events::{EventQuery, EventRouter, EventStatus, NewEvent, NewRule, RuleAction, RuleUpdate};
use crate::store::Database;

type ApiResponse = (StatusCode, Json<Value>);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<EventRouter>,
    pub store: Arc<dyn Database>,
}

/// Build the Axum router with event and rule routes.
pub fn api_routes(router: Arc<EventRouter>, store: Arc<dyn Database>) -> Router {
    let state = AppState { router, store };

    Router::new()
        .route("/health", get(health))
        .route("/api/events", get(list_events).post(ingest_event))
        .route("/api/events/{id}", get(get_event))
        .route("/api/events/{id}/actions", get(list_actions))
        .route("/api/events/{id}/process", post(process_event))
        .route("/api/events/{id}/reprocess", post(reprocess_event))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/{id}",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({"error": message.into()})))
}

fn router_error(e: RouterError) -> ApiResponse {
    let status = match &e {
        RouterError::NotFound { .. } => StatusCode::NOT_FOUND,
        RouterError::AlreadyProcessed { .. } => StatusCode::CONFLICT,
        RouterError::Config(_) => StatusCode::BAD_REQUEST,
        RouterError::Database(db) => {
            error!("API store failure: {db}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

fn parse_id(id: &str, entity: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid {entity} ID")))
}

fn to_json<T: serde::Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(v) => (status, Json(v)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "substrate"
    }))
}

// ── Events ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(flatten)]
    event: NewEvent,
    /// Route the event right away instead of waiting for the sweep.
    #[serde(default)]
    process: bool,
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(body): Json<IngestRequest>,
) -> ApiResponse {
    let event = match state.router.create_event(body.event).await {
        Ok(event) => event,
        Err(e) => return router_error(e),
    };
    info!(event_id = %event.id, source = %event.source, "Event received over HTTP");

    if !body.process || event.status != EventStatus::Pending {
        return to_json(StatusCode::CREATED, &json!({"event": event}));
    }

    match state.router.process_event(event.id).await {
        Ok(outcome) => to_json(
            StatusCode::CREATED,
            &json!({"event": event, "result": outcome}),
        ),
        Err(e) => router_error(e),
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> ApiResponse {
    match state.store.query_events(&query).await {
        Ok(events) => to_json(StatusCode::OK, &events),
        Err(e) => router_error(e.into()),
    }
}

async fn get_event(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id, "event") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get_event(id).await {
        Ok(Some(event)) => to_json(StatusCode::OK, &event),
        Ok(None) => router_error(RouterError::NotFound { id }),
        Err(e) => router_error(e.into()),
    }
}

async fn list_actions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id, "event") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.list_action_logs(id).await {
        Ok(logs) => to_json(StatusCode::OK, &logs),
        Err(e) => router_error(e.into()),
    }
}

async fn process_event(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id, "event") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.router.process_event(id).await {
        Ok(outcome) => to_json(StatusCode::OK, &outcome),
        Err(e) => router_error(e),
    }
}

async fn reprocess_event(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id, "event") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.router.reprocess_event(id).await {
        Ok(outcome) => to_json(StatusCode::OK, &outcome),
        Err(e) => router_error(e),
    }
}

// ── Rules ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListRulesQuery {
    #[serde(default)]
    enabled_only: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CreateRuleRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    conditions: Map<String, Value>,
    /// Kept as a string so unknown actions surface as a 400.
    action: String,
    #[serde(default)]
    action_config: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateRuleRequest {
    name: Option<String>,
    description: Option<String>,
    enabled: Option<bool>,
    priority: Option<i64>,
    conditions: Option<Map<String, Value>>,
    action: Option<String>,
    action_config: Option<Map<String, Value>>,
}

async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<ListRulesQuery>,
) -> ApiResponse {
    match state.router.list_rules(query.enabled_only).await {
        Ok(rules) => to_json(StatusCode::OK, &rules),
        Err(e) => router_error(e),
    }
}

async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<CreateRuleRequest>,
) -> ApiResponse {
    let action: RuleAction = match body.action.parse() {
        Ok(action) => action,
        Err(e) => return router_error(RouterError::Config(e)),
    };
    let rule = NewRule {
        name: body.name,
        description: body.description,
        enabled: body.enabled,
        priority: body.priority,
        conditions: body.conditions,
        action,
        action_config: body.action_config,
    };
    match state.router.create_rule(rule).await {
        Ok(rule) => {
            info!(rule_id = %rule.id, name = %rule.name, action = %rule.action, "Rule created");
            to_json(StatusCode::CREATED, &rule)
        }
        Err(e) => router_error(e),
    }
}

async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id, "rule") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.router.get_rule(id).await {
        Ok(Some(rule)) => to_json(StatusCode::OK, &rule),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Rule not found"),
        Err(e) => router_error(e),
    }
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRuleRequest>,
) -> ApiResponse {
    let id = match parse_id(&id, "rule") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let action = match body.action.as_deref().map(str::parse::<RuleAction>).transpose() {
        Ok(action) => action,
        Err(e) => return router_error(RouterError::Config(e)),
    };
    let update = RuleUpdate {
        name: body.name,
        description: body.description,
        enabled: body.enabled,
        priority: body.priority,
        conditions: body.conditions,
        action,
        action_config: body.action_config,
    };
    match state.router.update_rule(id, update).await {
        Ok(Some(rule)) => to_json(StatusCode::OK, &rule),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Rule not found"),
        Err(e) => router_error(e),
    }
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id, "rule") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.router.delete_rule(id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "deleted"}))),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Rule not found"),
        Err(e) => router_error(e),
    }
}
