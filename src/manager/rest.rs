// =============================================================================
// Manager REST API — Axum 0.7
// =============================================================================
//
// Fleet control and inspection endpoints, plus the internal status-report
// sink workers POST to.  CORS is permissive: the dashboard is served from a
// different origin during development.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::{supervise, SwarmState};
use crate::bot_runtime::StatusUpdate;

/// Build the full manager router (REST + WebSocket routes).
pub fn router(state: Arc<SwarmState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Fleet ───────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/swarm/spawn", post(spawn))
        .route("/swarm/spawn-batch", post(spawn_batch))
        .route("/swarm/status", get(swarm_status))
        .route("/swarm/account-pool", get(account_pool))
        .route("/swarm/timeseries/summary", get(timeseries_summary))
        .route("/swarm/clear", post(swarm_clear))
        .route("/swarm/kill-all", post(swarm_kill_all))
        // ── Per-bot ─────────────────────────────────────────────────
        .route("/bot/:id/status", get(bot_status))
        .route("/bot/:id", delete(bot_kill))
        .route("/bot/:id/restart", post(bot_restart))
        .route("/bot/:id/set-goal", post(bot_set_goal))
        .route("/bot/:id/events", get(bot_events))
        // ── Worker-internal ─────────────────────────────────────────
        .route("/internal/bot-status", post(internal_bot_status))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws/swarm", get(super::ws::swarm_feed))
        .route("/ws/bot/:id/logs", get(super::ws::bot_logs))
        .route("/ws/bot/:id/term", get(super::ws::bot_term))
        .route("/internal/worker/:id", get(super::ws::worker_channel))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Fleet endpoints
// =============================================================================

async fn health(State(state): State<Arc<SwarmState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.uptime_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct SpawnQuery {
    config_path: String,
    bot_id: Option<String>,
}

async fn spawn(
    State(state): State<Arc<SwarmState>>,
    Query(query): Query<SpawnQuery>,
) -> impl IntoResponse {
    match supervise::spawn_bot(&state, &query.config_path, query.bot_id).await {
        Ok(bot_id) => (StatusCode::OK, Json(json!({ "bot_id": bot_id }))),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct SpawnBatchRequest {
    config_paths: Vec<String>,
    #[serde(default = "default_group_size")]
    group_size: usize,
    /// Seconds between groups.
    #[serde(default = "default_group_delay")]
    group_delay: u64,
}

fn default_group_size() -> usize {
    2
}

fn default_group_delay() -> u64 {
    5
}

async fn spawn_batch(
    State(state): State<Arc<SwarmState>>,
    Json(request): Json<SpawnBatchRequest>,
) -> impl IntoResponse {
    let plan = supervise::batch_plan(
        request.config_paths.len(),
        request.group_size,
        request.group_delay,
    );
    supervise::spawn_batch(
        Arc::clone(&state),
        request.config_paths,
        request.group_size,
        Duration::from_secs(request.group_delay),
    );
    Json(plan)
}

async fn swarm_status(State(state): State<Arc<SwarmState>>) -> impl IntoResponse {
    Json(state.build_status_snapshot())
}

async fn account_pool(State(state): State<Arc<SwarmState>>) -> impl IntoResponse {
    let mut payload = state.account_pool.describe();
    let status = state.account_pool.status();
    if let Some(pool) = payload["pool"].as_object_mut() {
        pool.insert("accounts_total".into(), json!(status.accounts_total));
        pool.insert("leased".into(), json!(status.leased));
        pool.insert("available".into(), json!(status.available));
        pool.insert("cooldown".into(), json!(status.cooldown));
    }
    Json(payload)
}

#[derive(Deserialize)]
struct WindowQuery {
    window_minutes: Option<u64>,
}

async fn timeseries_summary(
    State(state): State<Arc<SwarmState>>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let window = query
        .window_minutes
        .map(|m| Duration::from_secs(m * 60));
    Json(state.telemetry.fleet_summary(window))
}

async fn swarm_clear(State(state): State<Arc<SwarmState>>) -> impl IntoResponse {
    let dropped = supervise::clear(&state);
    info!(dropped, "swarm cleared via API");
    Json(json!({ "dropped": dropped }))
}

async fn swarm_kill_all(State(state): State<Arc<SwarmState>>) -> impl IntoResponse {
    let killed = supervise::kill_all(&state);
    info!(killed, "kill-all via API");
    Json(json!({ "killed": killed }))
}

// =============================================================================
// Per-bot endpoints
// =============================================================================

async fn bot_status(
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.bots.read().get(&id) {
        Some(record) => (StatusCode::OK, Json(record.to_status_json())),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("bot {id} not found") })),
        ),
    }
}

async fn bot_kill(
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if supervise::kill_bot(&state, &id) {
        Json(json!({ "killed": id })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("bot {id} not found or already terminal") })),
        )
            .into_response()
    }
}

async fn bot_restart(
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match supervise::restart_bot(&state, &id).await {
        Ok(bot_id) => (StatusCode::OK, Json(json!({ "bot_id": bot_id }))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct SetGoalRequest {
    goal_id: String,
    #[serde(default)]
    reason: String,
}

async fn bot_set_goal(
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
    Json(request): Json<SetGoalRequest>,
) -> impl IntoResponse {
    let Some(link) = state.worker_link(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("bot {id} has no live worker channel") })),
        );
    };
    let command = json!({
        "type": "set_goal",
        "goal_id": request.goal_id,
        "reason": request.reason,
    });
    if link.to_worker.send(command.to_string()).is_err() {
        return (
            StatusCode::GONE,
            Json(json!({ "error": "worker channel closed" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "bot_id": id, "goal_id": request.goal_id })),
    )
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
    event_type: Option<String>,
}

async fn bot_events(
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let log_path = state
        .bots
        .read()
        .get(&id)
        .and_then(|b| b.status.log_path.clone());
    let Some(log_path) = log_path else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("bot {id} has no known log") })),
        );
    };

    let limit = query.limit.unwrap_or(100).min(1000);
    let content = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
    let events: Vec<serde_json::Value> = content
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter(|v| {
            query
                .event_type
                .as_deref()
                .map(|t| v["event"] == t)
                .unwrap_or(true)
        })
        .collect();
    let start = events.len().saturating_sub(limit);
    (
        StatusCode::OK,
        Json(json!({ "bot_id": id, "events": &events[start..] })),
    )
}

// =============================================================================
// Worker-internal endpoints
// =============================================================================

async fn internal_bot_status(
    State(state): State<Arc<SwarmState>>,
    Json(update): Json<StatusUpdate>,
) -> impl IntoResponse {
    state.update_status(update);
    StatusCode::NO_CONTENT
}
