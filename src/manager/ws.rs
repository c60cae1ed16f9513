// =============================================================================
// Manager WebSocket surfaces
// =============================================================================
//
//   /ws/swarm             — fleet status snapshots pushed on an interval.
//   /ws/bot/{id}/logs     — tail of the worker's session log.
//   /ws/bot/{id}/term     — spy/hijack channel bridged to the worker.
//   /internal/worker/{id} — the worker's end of the term bridge.
//
// The term bridge is a fan-out: every worker event is broadcast to all
// subscribed spy clients; commands from whichever client holds the hijack
// are forwarded down the single worker link.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SwarmState;

// =============================================================================
// /ws/swarm — fleet feed
// =============================================================================

pub async fn swarm_feed(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SwarmState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_swarm_feed(socket, state))
}

async fn handle_swarm_feed(socket: WebSocket, state: Arc<SwarmState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut push = interval(Duration::from_secs(
        state.config.status_broadcast_interval.max(1),
    ));

    info!("swarm feed subscriber connected");
    loop {
        tokio::select! {
            _ = push.tick() => {
                let snapshot = state.build_status_snapshot();
                if sender
                    .send(Message::Text(snapshot.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    // Client pings (text or frame) are ignored by design.
                    Some(Ok(Message::Text(_))) => {}
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    debug!("swarm feed subscriber disconnected");
}

// =============================================================================
// /ws/bot/{id}/logs — log tail
// =============================================================================

pub async fn bot_logs(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_bot_logs(socket, state, id))
}

async fn handle_bot_logs(socket: WebSocket, state: Arc<SwarmState>, bot_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let log_path = state
        .bots
        .read()
        .get(&bot_id)
        .and_then(|b| b.status.log_path.clone());
    let Some(log_path) = log_path else {
        let _ = sender
            .send(Message::Text(
                json!({ "type": "error", "message": "no log known for this bot" })
                    .to_string()
                    .into(),
            ))
            .await;
        return;
    };

    // Initial chunk: the last 100 lines.
    let mut offset = {
        let content = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(100);
        let initial = json!({ "type": "initial", "lines": &lines[start..] });
        if sender
            .send(Message::Text(initial.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
        content.len() as u64
    };

    let mut poll = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = poll.tick() => {
                let Ok(metadata) = tokio::fs::metadata(&log_path).await else { continue };
                let len = metadata.len();
                if len < offset {
                    // Rotated or truncated: start over.
                    offset = 0;
                    let truncated = json!({ "type": "truncated", "lines": [] });
                    if sender.send(Message::Text(truncated.to_string().into())).await.is_err() {
                        break;
                    }
                }
                if len > offset {
                    let content = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                    let appended: Vec<&str> = content[offset as usize..].lines().collect();
                    offset = len;
                    let msg = json!({ "type": "append", "lines": appended });
                    if sender.send(Message::Text(msg.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

// =============================================================================
// /ws/bot/{id}/term — spy/hijack client
// =============================================================================

pub async fn bot_term(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_bot_term(socket, state, id))
}

async fn handle_bot_term(socket: WebSocket, state: Arc<SwarmState>, bot_id: String) {
    let (mut sender, mut receiver) = socket.split();
    // The connection id doubles as the hijack owner name.
    let conn_id = format!("ui-{}", &Uuid::new_v4().to_string()[..8]);

    let Some(link) = state.worker_link(&bot_id) else {
        let _ = sender
            .send(Message::Text(
                json!({ "type": "error", "message": "worker channel not connected" })
                    .to_string()
                    .into(),
            ))
            .await;
        return;
    };
    let mut events = link.events.subscribe();

    // Greeting with the current hijack state.
    let (hijacked, hijacked_by) = {
        let bots = state.bots.read();
        let record = bots.get(&bot_id);
        (
            record.map(|r| r.is_hijacked).unwrap_or(false),
            record.and_then(|r| r.hijacked_by.clone()),
        )
    };
    let hello = json!({
        "type": "hello",
        "hijacked": hijacked,
        "hijacked_by_me": hijacked_by.as_deref() == Some(conn_id.as_str()),
    });
    if sender.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }
    info!(bot_id = %bot_id, conn = %conn_id, "term client connected");

    loop {
        tokio::select! {
            // ── Worker events fanned out to this client ─────────────────
            event = events.recv() => {
                match event {
                    Ok(text) => {
                        let rewritten = rewrite_owner_for_client(&text, &conn_id);
                        if sender.send(Message::Text(rewritten.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "term client lagged; frames dropped");
                    }
                    Err(_) => break,
                }
            }

            // ── Client commands bridged down to the worker ──────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(mut command) = serde_json::from_str::<serde_json::Value>(&text) else {
                            continue;
                        };
                        // Hijack requests carry this connection's identity.
                        if command["type"] == "hijack_request" {
                            command["owner"] = json!(conn_id);
                        }
                        if link.to_worker.send(command.to_string()).is_err() {
                            let _ = sender.send(Message::Text(
                                json!({ "type": "error", "message": "worker channel closed" })
                                    .to_string().into(),
                            )).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    // A departing hijack owner releases implicitly.
    if state
        .bots
        .read()
        .get(&bot_id)
        .map(|r| r.hijacked_by.as_deref() == Some(conn_id.as_str()))
        .unwrap_or(false)
    {
        let _ = link
            .to_worker
            .send(json!({ "type": "hijack_release" }).to_string());
    }
    debug!(bot_id = %bot_id, conn = %conn_id, "term client disconnected");
}

/// Rewrite a worker hijack_state owner into the client-relative form
/// ("me" | "other" | "none").
fn rewrite_owner_for_client(text: &str, conn_id: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(text) else {
        return text.to_string();
    };
    if value["type"] == "hijack_state" {
        let owner = value["owner"].as_str().unwrap_or("none");
        let relative = if owner == "none" {
            "none"
        } else if owner == conn_id {
            "me"
        } else {
            "other"
        };
        value["owner"] = json!(relative);
        return value.to_string();
    }
    text.to_string()
}

// =============================================================================
// /internal/worker/{id} — the worker's end of the bridge
// =============================================================================

pub async fn worker_channel(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SwarmState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_worker_channel(socket, state, id))
}

async fn handle_worker_channel(socket: WebSocket, state: Arc<SwarmState>, bot_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (link, mut from_manager) = state.register_worker_link(&bot_id);
    info!(bot_id = %bot_id, "worker channel registered");

    loop {
        tokio::select! {
            // ── Commands queued for the worker ──────────────────────────
            command = from_manager.recv() => {
                let Some(command) = command else { break };
                if sender.send(Message::Text(command.into())).await.is_err() {
                    break;
                }
            }

            // ── Events from the worker ──────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Track hijack bookkeeping as state flows by.
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value["type"] == "hijack_state" {
                                let hijacked = value["hijacked"].as_bool().unwrap_or(false);
                                let owner = value["owner"]
                                    .as_str()
                                    .filter(|&o| o != "none" && o != "other")
                                    .map(str::to_string);
                                state.set_hijack(&bot_id, hijacked, owner);
                            }
                        }
                        // Fan out to spy subscribers (no receivers is fine).
                        let _ = link.events.send(text.to_string());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.drop_worker_link(&bot_id);
    warn!(bot_id = %bot_id, "worker channel closed");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_rewriting_is_client_relative() {
        let msg = json!({ "type": "hijack_state", "hijacked": true, "owner": "ui-abc" }).to_string();
        let me = rewrite_owner_for_client(&msg, "ui-abc");
        let other = rewrite_owner_for_client(&msg, "ui-xyz");
        assert_eq!(serde_json::from_str::<serde_json::Value>(&me).unwrap()["owner"], "me");
        assert_eq!(serde_json::from_str::<serde_json::Value>(&other).unwrap()["owner"], "other");

        let released = json!({ "type": "hijack_state", "hijacked": false, "owner": "none" }).to_string();
        let relative = rewrite_owner_for_client(&released, "ui-abc");
        assert_eq!(serde_json::from_str::<serde_json::Value>(&relative).unwrap()["owner"], "none");
    }

    #[test]
    fn non_hijack_messages_pass_through_untouched() {
        let msg = json!({ "type": "term", "data": "hello" }).to_string();
        assert_eq!(rewrite_owner_for_client(&msg, "ui-abc"), msg);
        assert_eq!(rewrite_owner_for_client("not json", "ui-abc"), "not json");
    }
}
