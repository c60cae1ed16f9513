// =============================================================================
// Worker Channel — the bot process's link back to the swarm manager
// =============================================================================
//
// Two channels per worker:
//   1. Status reports: every turn's StatusUpdate is POSTed to the manager's
//      internal HTTP endpoint (fire-and-forget; a missed report only delays
//      the dashboard by one turn).
//   2. Terminal channel: a persistent WebSocket carrying raw terminal
//      fragments and screen snapshots up to the manager, and hijack
//      commands plus injected keystrokes back down.  Reconnects with a
//      fixed backoff when the manager restarts.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bot_runtime::{HijackControl, StatusSink, StatusUpdate};
use crate::session::Session;
use crate::terminal::cp437_to_char;

// =============================================================================
// Status reporter
// =============================================================================

/// POSTs status updates to the manager. Cheap to clone into the runtime.
pub struct ManagerReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl ManagerReporter {
    pub fn new(manager_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build reqwest client"),
            endpoint: format!("{}/internal/bot-status", manager_url.trim_end_matches('/')),
        }
    }
}

impl StatusSink for ManagerReporter {
    fn report(&self, update: StatusUpdate) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&endpoint).json(&update).send().await {
                debug!(error = %e, "status report dropped");
            }
        });
    }
}

// =============================================================================
// Screen analysis
// =============================================================================

/// Structured screen analysis for spy/hijack clients: current prompt, KV
/// data, matched and partially matched rules, and a human-readable
/// recommendation keyed to the prompt family.
pub fn build_screen_analysis(session: &Session) -> Value {
    let (snapshot, outcome) = session.analyze_current();

    let recommendation = match outcome.detection.as_ref().map(|d| d.prompt_id.as_str()) {
        Some(id) if id.contains("sector_command") => {
            "known sector command prompt — ask the bot to move or trade"
        }
        Some(id) if id.contains("port") => {
            "port dialogue — step the bot through the trade or send keys manually"
        }
        Some(id) if id.contains("pause") => "benign pause — a space will clear it",
        Some(id) if id.contains("login") || id.contains("name") || id.contains("password") => {
            "login flow — the bot answers these from its leased identity"
        }
        Some(_) => "recognized prompt — a hijack step will run the bot's next action",
        None => "no rule matched — check the partial matches for a missing or too-strict rule",
    };

    json!({
        "screen_text": snapshot.screen_text,
        "screen_hash": snapshot.screen_hash,
        "cursor": snapshot.cursor,
        "cursor_at_end": snapshot.cursor_at_end,
        "has_trailing_space": snapshot.has_trailing_space,
        "prompt_id": outcome.detection.as_ref().map(|d| d.prompt_id.clone()),
        "input_type": outcome.detection.as_ref().map(|d| d.input_type.to_string()),
        "kv_data": outcome.detection.as_ref().and_then(|d| d.kv_data.clone()),
        "matched_rules": outcome.matched_rule_ids,
        "partial_matches": outcome.partial_matches,
        "recommendation": recommendation,
    })
}

// =============================================================================
// Terminal channel
// =============================================================================

pub struct WorkerChannel {
    ws_url: String,
    bot_id: String,
}

impl WorkerChannel {
    pub fn new(manager_url: &str, bot_id: &str) -> Self {
        let ws_base = manager_url
            .trim_end_matches('/')
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        Self {
            ws_url: format!("{ws_base}/internal/worker/{bot_id}"),
            bot_id: bot_id.to_string(),
        }
    }

    /// Run the channel until `stop` is set. Reconnects on failure.
    pub async fn run(
        self,
        session: Arc<Session>,
        hijack: Arc<HijackControl>,
        stop: Arc<AtomicBool>,
    ) {
        while !stop.load(Ordering::SeqCst) {
            match self.run_once(&session, &hijack, &stop).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(bot_id = %self.bot_id, error = %e, "worker channel dropped; reconnecting in 3s");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
        session.set_raw_tap(None);
    }

    async fn run_once(
        &self,
        session: &Arc<Session>,
        hijack: &Arc<HijackControl>,
        stop: &Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        let (ws, _) = connect_async(&self.ws_url).await?;
        info!(bot_id = %self.bot_id, url = %self.ws_url, "worker channel connected");
        let (mut sink, mut stream) = ws.split();

        // Tap raw session bytes for term forwarding.
        let (tap_tx, mut tap_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        session.set_raw_tap(Some(tap_tx));

        let mut snapshot_tick = tokio::time::interval(Duration::from_millis(750));
        let mut last_pushed_hash = String::new();
        let mut last_hijack_owner: Option<String> = hijack.owner();

        loop {
            if stop.load(Ordering::SeqCst) {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }

            tokio::select! {
                // ── Raw terminal fragments ──────────────────────────────
                Some(raw) = tap_rx.recv() => {
                    let text: String = raw.iter().map(|&b| cp437_to_char(b)).collect();
                    let msg = json!({ "type": "term", "data": text });
                    sink.send(Message::Text(msg.to_string().into())).await?;
                }

                // ── Periodic snapshot pushes on change ──────────────────
                _ = snapshot_tick.tick() => {
                    let (snapshot, outcome) = session.analyze_current();
                    if snapshot.screen_hash != last_pushed_hash {
                        last_pushed_hash = snapshot.screen_hash.clone();
                        let msg = json!({
                            "type": "snapshot",
                            "screen": snapshot.screen_text,
                            "prompt_detected": outcome.detection.as_ref().map(|d| d.prompt_id.clone()),
                            "cursor": snapshot.cursor,
                        });
                        sink.send(Message::Text(msg.to_string().into())).await?;
                    }

                    // The inspection itself enforces heartbeat expiry, so
                    // expired leases surface here as a state change.
                    let hijacked = hijack.is_hijacked();
                    let owner = hijack.owner();
                    if owner != last_hijack_owner {
                        last_hijack_owner = owner.clone();
                        let msg = json!({
                            "type": "hijack_state",
                            "hijacked": hijacked,
                            "owner": owner.unwrap_or_else(|| "none".to_string()),
                        });
                        sink.send(Message::Text(msg.to_string().into())).await?;
                    }
                }

                // ── Commands from the manager ───────────────────────────
                incoming = stream.next() => {
                    let Some(incoming) = incoming else {
                        anyhow::bail!("manager closed the channel");
                    };
                    match incoming? {
                        Message::Text(text) => {
                            if let Some(reply) = self.handle_command(&text, session, hijack) {
                                sink.send(Message::Text(reply.to_string().into())).await?;
                            }
                        }
                        Message::Ping(data) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Message::Close(_) => anyhow::bail!("manager closed the channel"),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Apply one manager command; returns an optional reply message.
    fn handle_command(
        &self,
        text: &str,
        session: &Arc<Session>,
        hijack: &Arc<HijackControl>,
    ) -> Option<Value> {
        let command: Value = serde_json::from_str(text).ok()?;
        match command["type"].as_str()? {
            "hijack_request" => {
                let owner = command["owner"].as_str().unwrap_or("manager");
                let granted = hijack.request(owner);
                Some(json!({
                    "type": "hijack_state",
                    "hijacked": granted,
                    "owner": if granted { owner } else { "other" },
                }))
            }
            "hijack_release" => {
                hijack.release();
                Some(json!({ "type": "hijack_state", "hijacked": false, "owner": "none" }))
            }
            "hijack_step" => {
                hijack.queue_step();
                None
            }
            "heartbeat" => {
                hijack.heartbeat();
                Some(json!({ "type": "heartbeat_ack" }))
            }
            "input" => {
                if let Some(data) = command["data"].as_str() {
                    hijack.inject_input(data.to_string());
                }
                None
            }
            "set_goal" => {
                let goal = command["goal_id"].as_str().unwrap_or("profit");
                let reason = command["reason"].as_str().unwrap_or("operator request");
                hijack.request_goal(goal, reason);
                None
            }
            "snapshot_req" => {
                let (snapshot, outcome) = session.analyze_current();
                Some(json!({
                    "type": "snapshot",
                    "screen": snapshot.screen_text,
                    "prompt_detected": outcome.detection.as_ref().map(|d| d.prompt_id.clone()),
                    "cursor": snapshot.cursor,
                }))
            }
            "analyze_req" => {
                let analysis = build_screen_analysis(session);
                Some(json!({
                    "type": "analysis",
                    "formatted": analysis["recommendation"],
                    "raw": analysis,
                }))
            }
            other => {
                debug!(command = other, "unknown worker command ignored");
                Some(json!({ "type": "error", "message": format!("unknown command '{other}'") }))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::rules::RuleSet;
    use crate::session::SessionParams;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn quiet_session() -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        let mut params = SessionParams::new("127.0.0.1", addr.port());
        params.rules = RuleSet::empty("t");
        Session::connect(params).await.unwrap()
    }

    #[tokio::test]
    async fn hijack_commands_drive_shared_state() {
        let session = quiet_session().await;
        let hijack = Arc::new(HijackControl::new(Duration::from_secs(30)));
        let channel = WorkerChannel::new("http://127.0.0.1:9", "b1");

        let reply = channel
            .handle_command(
                r#"{"type":"hijack_request","owner":"ui-7"}"#,
                &session,
                &hijack,
            )
            .unwrap();
        assert_eq!(reply["type"], "hijack_state");
        assert_eq!(reply["hijacked"], true);
        assert_eq!(hijack.owner().as_deref(), Some("ui-7"));

        channel.handle_command(r#"{"type":"hijack_step"}"#, &session, &hijack);
        assert!(hijack.take_step());

        channel.handle_command(
            r#"{"type":"input","data":"M5\r"}"#,
            &session,
            &hijack,
        );
        assert_eq!(hijack.take_input().as_deref(), Some("M5\r"));

        let reply = channel
            .handle_command(r#"{"type":"heartbeat"}"#, &session, &hijack)
            .unwrap();
        assert_eq!(reply["type"], "heartbeat_ack");

        let reply = channel
            .handle_command(r#"{"type":"hijack_release"}"#, &session, &hijack)
            .unwrap();
        assert_eq!(reply["hijacked"], false);
        assert!(hijack.owner().is_none());
    }

    #[tokio::test]
    async fn snapshot_req_returns_screen() {
        let session = quiet_session().await;
        let hijack = Arc::new(HijackControl::new(Duration::from_secs(30)));
        let channel = WorkerChannel::new("http://127.0.0.1:9", "b1");

        let reply = channel
            .handle_command(r#"{"type":"snapshot_req"}"#, &session, &hijack)
            .unwrap();
        assert_eq!(reply["type"], "snapshot");
        assert!(reply["screen"].is_string());
        assert!(reply["cursor"]["col"].is_u64());
    }

    #[tokio::test]
    async fn analysis_includes_partial_match_diagnostics() {
        let session = quiet_session().await;
        let analysis = build_screen_analysis(&session);
        assert!(analysis["matched_rules"].is_array());
        assert!(analysis["partial_matches"].is_array());
        assert!(analysis["recommendation"].is_string());
        assert!(analysis["screen_hash"].is_string());
    }

    #[tokio::test]
    async fn unknown_command_reports_error() {
        let session = quiet_session().await;
        let hijack = Arc::new(HijackControl::new(Duration::from_secs(30)));
        let channel = WorkerChannel::new("http://127.0.0.1:9", "b1");
        let reply = channel
            .handle_command(r#"{"type":"warp_ten"}"#, &session, &hijack)
            .unwrap();
        assert_eq!(reply["type"], "error");
    }

    #[test]
    fn ws_url_derived_from_http_url() {
        let c = WorkerChannel::new("http://127.0.0.1:8700/", "bot-3");
        assert_eq!(c.ws_url, "ws://127.0.0.1:8700/internal/worker/bot-3");
    }
}
