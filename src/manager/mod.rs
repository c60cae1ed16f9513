// =============================================================================
// Swarm Manager State — the bot registry and fleet snapshot builder
// =============================================================================
//
// The single source of truth for the manager process.  All subsystems (REST
// handlers, WebSocket feeds, the process supervisor, the health checker)
// share one Arc<SwarmState>; the BotRecord registry has a single logical
// writer path guarded by one RwLock.
//
// Lifecycle monotonicity: a record in a terminal state never transitions
// back to running except through a fresh spawn (which replaces the record),
// and last_update_time never decreases.
// =============================================================================

pub mod rest;
pub mod supervise;
pub mod ws;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::accounts::AccountPool;
use crate::bot_runtime::StatusUpdate;
use crate::config::{CharacterConfig, SwarmManagerConfig};
use crate::telemetry::{BotCounters, TelemetryStore};

// =============================================================================
// Bot lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Queued,
    Running,
    Recovering,
    Blocked,
    Completed,
    Error,
    Stopped,
    Disconnected,
}

impl BotState {
    /// Terminal states never transition back to running.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Stopped | Self::Disconnected
        )
    }
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// Everything the manager tracks about one bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRecord {
    pub bot_id: String,
    pub state: BotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub spawn_config: String,
    /// Unix epoch seconds; non-decreasing.
    pub last_update_time: f64,
    pub last_action_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    #[serde(default)]
    pub is_hijacked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hijacked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hijacked_at: Option<String>,
    /// Latest telemetry payload from the worker.
    #[serde(default)]
    pub status: StatusUpdate,
}

fn epoch_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl BotRecord {
    pub fn new(bot_id: &str, spawn_config: &str) -> Self {
        let now = epoch_secs();
        Self {
            bot_id: bot_id.to_string(),
            state: BotState::Queued,
            pid: None,
            spawn_config: spawn_config.to_string(),
            last_update_time: now,
            last_action_time: now,
            error_type: None,
            error_message: None,
            exit_reason: None,
            is_hijacked: false,
            hijacked_by: None,
            hijacked_at: None,
            status: StatusUpdate {
                bot_id: bot_id.to_string(),
                ..Default::default()
            },
        }
    }

    fn touch(&mut self) {
        // last_update_time is monotone even if the wall clock stutters.
        self.last_update_time = self.last_update_time.max(epoch_secs());
    }

    /// One §status-snapshot bots[] entry.
    pub fn to_status_json(&self) -> Value {
        let s = &self.status;
        json!({
            "bot_id": self.bot_id,
            "state": self.state.to_string(),
            "sector": s.sector,
            "credits": s.credits,
            "turns_executed": s.turns_executed,
            "turns_max": s.turns_max,
            "trades_executed": s.trades_executed,
            "credits_delta": s.credits_delta,
            "credits_per_turn": s.credits_per_turn,
            "haggle_accept": s.haggle_accept,
            "haggle_counter": s.haggle_counter,
            "haggle_too_high": s.haggle_too_high,
            "haggle_too_low": s.haggle_too_low,
            "llm_wakeups": s.llm_wakeups,
            "ship_level": s.ship_level,
            "username": s.username,
            "strategy": s.strategy,
            "strategy_id": s.strategy_id,
            "strategy_mode": s.strategy_mode,
            "strategy_intent": s.strategy_intent,
            "activity_context": s.activity_context,
            "status_detail": s.status_detail,
            "prompt_id": s.prompt_id,
            "last_update_time": self.last_update_time,
            "last_action_time": self.last_action_time,
            "is_hijacked": self.is_hijacked,
            "hijacked_by": self.hijacked_by,
            "hijacked_at": self.hijacked_at,
            "error_type": self.error_type,
            "error_message": self.error_message,
            "exit_reason": self.exit_reason,
            "cargo_fuel_ore": s.cargo_fuel_ore,
            "cargo_organics": s.cargo_organics,
            "cargo_equipment": s.cargo_equipment,
        })
    }
}

// =============================================================================
// Worker links (term/hijack channels)
// =============================================================================

/// The manager side of one worker's terminal channel.
#[derive(Clone)]
pub struct WorkerLink {
    /// Commands down to the worker.
    pub to_worker: mpsc::UnboundedSender<String>,
    /// Worker events (term/snapshot/analysis/hijack_state) fanned out to
    /// every spy subscriber.
    pub events: broadcast::Sender<String>,
}

// =============================================================================
// SwarmState
// =============================================================================

pub struct SwarmState {
    pub config: SwarmManagerConfig,
    pub bots: RwLock<HashMap<String, BotRecord>>,
    /// Kill switches for supervised child processes.
    pub kill_switches: RwLock<HashMap<String, mpsc::UnboundedSender<()>>>,
    pub worker_links: RwLock<HashMap<String, WorkerLink>>,
    pub account_pool: AccountPool,
    pub telemetry: TelemetryStore,
    pub start_time: Instant,
    state_file: PathBuf,
}

impl SwarmState {
    pub fn new(config: SwarmManagerConfig, character: CharacterConfig) -> Self {
        let state_file = PathBuf::from(&config.state_file);
        Self {
            config,
            bots: RwLock::new(HashMap::new()),
            kill_switches: RwLock::new(HashMap::new()),
            worker_links: RwLock::new(HashMap::new()),
            account_pool: AccountPool::new(character, true),
            telemetry: TelemetryStore::new(),
            start_time: Instant::now(),
            state_file,
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    // ── Lifecycle transitions ───────────────────────────────────────────

    /// Apply a state transition. Terminal states are sticky: only a new
    /// spawn (replacing the record) brings a bot back.
    pub fn transition(
        &self,
        bot_id: &str,
        new_state: BotState,
        exit_reason: Option<String>,
    ) -> bool {
        let mut bots = self.bots.write();
        let Some(record) = bots.get_mut(bot_id) else {
            return false;
        };
        if record.state.is_terminal() {
            warn!(
                bot_id,
                from = %record.state,
                to = %new_state,
                "transition from terminal state refused"
            );
            return false;
        }
        info!(bot_id, from = %record.state, to = %new_state, "bot state transition");
        record.state = new_state;
        if let Some(reason) = exit_reason {
            record.exit_reason = Some(reason);
        }
        record.touch();
        true
    }

    pub fn set_error(&self, bot_id: &str, error_type: &str, message: &str) {
        {
            let mut bots = self.bots.write();
            if let Some(record) = bots.get_mut(bot_id) {
                record.error_type = Some(error_type.to_string());
                record.error_message = Some(message.to_string());
            }
        }
        self.transition(bot_id, BotState::Error, Some(message.to_string()));
    }

    /// Ingest a worker status report.
    pub fn update_status(&self, update: StatusUpdate) {
        let mut bots = self.bots.write();
        let Some(record) = bots.get_mut(&update.bot_id) else {
            warn!(bot_id = %update.bot_id, "status for unknown bot dropped");
            return;
        };

        // A blocked worker that reports again is running after all.
        if record.state == BotState::Blocked || record.state == BotState::Recovering {
            record.state = BotState::Running;
        }
        record.last_action_time = epoch_secs();
        record.touch();

        self.telemetry.record(
            &update.bot_id,
            update.credits.unwrap_or(0),
            update.sector,
            update.turns_executed,
            BotCounters {
                trades_executed: update.trades_executed,
                haggle_accept: update.haggle_accept,
                haggle_counter: update.haggle_counter,
                haggle_too_high: update.haggle_too_high,
                haggle_too_low: update.haggle_too_low,
                credits_delta: update.credits_delta,
                credits_per_turn: update.credits_per_turn,
                llm_wakeups: update.llm_wakeups,
                ..Default::default()
            },
            &update.strategy_id,
        );
        record.status = update;
    }

    /// Record a hijack state observed on the worker channel.
    pub fn set_hijack(&self, bot_id: &str, hijacked: bool, owner: Option<String>) {
        let mut bots = self.bots.write();
        if let Some(record) = bots.get_mut(bot_id) {
            record.is_hijacked = hijacked;
            record.hijacked_by = owner;
            record.hijacked_at = if hijacked {
                Some(Utc::now().to_rfc3339())
            } else {
                None
            };
            record.touch();
        }
    }

    // ── Worker links ────────────────────────────────────────────────────

    pub fn register_worker_link(&self, bot_id: &str) -> (WorkerLink, mpsc::UnboundedReceiver<String>) {
        let (to_worker, from_manager) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let link = WorkerLink { to_worker, events };
        self.worker_links
            .write()
            .insert(bot_id.to_string(), link.clone());
        (link, from_manager)
    }

    pub fn worker_link(&self, bot_id: &str) -> Option<WorkerLink> {
        self.worker_links.read().get(bot_id).cloned()
    }

    pub fn drop_worker_link(&self, bot_id: &str) {
        self.worker_links.write().remove(bot_id);
    }

    // ── Fleet snapshot ──────────────────────────────────────────────────

    /// The §status-snapshot JSON served over HTTP and pushed on /ws/swarm.
    pub fn build_status_snapshot(&self) -> Value {
        let bots = self.bots.read();
        let mut counts: HashMap<&'static str, u32> = HashMap::new();
        let mut total_credits = 0i64;
        let mut total_turns = 0u64;

        let mut entries: Vec<Value> = Vec::with_capacity(bots.len());
        for record in bots.values() {
            let key = match record.state {
                BotState::Running => "running",
                BotState::Completed => "completed",
                BotState::Error => "errors",
                BotState::Queued => "queued",
                BotState::Blocked => "blocked",
                BotState::Recovering => "recovering",
                BotState::Stopped => "stopped",
                BotState::Disconnected => "disconnected",
            };
            *counts.entry(key).or_default() += 1;
            total_credits += record.status.credits.unwrap_or(0);
            total_turns += u64::from(record.status.turns_executed);
            entries.push(record.to_status_json());
        }
        entries.sort_by(|a, b| a["bot_id"].as_str().cmp(&b["bot_id"].as_str()));

        json!({
            "running": counts.get("running").copied().unwrap_or(0),
            "total_bots": bots.len(),
            "completed": counts.get("completed").copied().unwrap_or(0),
            "errors": counts.get("errors").copied().unwrap_or(0),
            "blocked": counts.get("blocked").copied().unwrap_or(0),
            "stopped": counts.get("stopped").copied().unwrap_or(0),
            "disconnected": counts.get("disconnected").copied().unwrap_or(0),
            "total_credits": total_credits,
            "total_turns": total_turns,
            "uptime_seconds": self.uptime_seconds(),
            "bots": entries,
        })
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Flush the registry to swarm_state.json (atomic write-and-rename).
    /// Records hold no credentials, so the whole registry is persisted.
    pub fn flush_state(&self) -> anyhow::Result<()> {
        let records: Vec<BotRecord> = self.bots.read().values().cloned().collect();
        let payload = json!({
            "saved_at": Utc::now().to_rfc3339(),
            "bots": records,
        });

        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&payload)?)?;
        std::fs::rename(&tmp, &self.state_file)?;
        Ok(())
    }

    /// Restore historical records for visibility.  Never resurrects a
    /// running process: non-terminal states load as stopped with an
    /// explanatory exit reason.
    pub fn restore_state(&self) {
        let Ok(content) = std::fs::read_to_string(&self.state_file) else {
            return;
        };
        let Ok(payload) = serde_json::from_str::<Value>(&content) else {
            warn!(path = %self.state_file.display(), "swarm state file unreadable; ignored");
            return;
        };
        let Some(records) = payload["bots"].as_array() else {
            return;
        };

        let mut restored = 0usize;
        let mut bots = self.bots.write();
        for value in records {
            let Ok(mut record) = serde_json::from_value::<BotRecord>(value.clone()) else {
                continue;
            };
            if !record.state.is_terminal() {
                record.state = BotState::Stopped;
                record.exit_reason = Some("manager restarted; process not resurrected".to_string());
            }
            record.pid = None;
            record.is_hijacked = false;
            record.hijacked_by = None;
            bots.insert(record.bot_id.clone(), record);
            restored += 1;
        }
        info!(restored, "historical bot records restored");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_file(path: PathBuf) -> SwarmState {
        let config = SwarmManagerConfig {
            state_file: path.to_string_lossy().into_owned(),
            ..Default::default()
        };
        SwarmState::new(config, CharacterConfig::default())
    }

    fn state() -> SwarmState {
        state_with_file(PathBuf::from("/tmp/unused_swarm_state.json"))
    }

    fn insert_bot(s: &SwarmState, id: &str) {
        s.bots
            .write()
            .insert(id.to_string(), BotRecord::new(id, "cfg.json"));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let s = state();
        insert_bot(&s, "b1");

        assert!(s.transition("b1", BotState::Running, None));
        assert!(s.transition("b1", BotState::Completed, Some("turn budget".into())));
        // Once terminal, no way back without a new spawn.
        assert!(!s.transition("b1", BotState::Running, None));
        assert_eq!(s.bots.read()["b1"].state, BotState::Completed);
    }

    #[test]
    fn last_update_time_is_monotone() {
        let s = state();
        insert_bot(&s, "b1");
        let t0 = s.bots.read()["b1"].last_update_time;
        s.transition("b1", BotState::Running, None);
        let t1 = s.bots.read()["b1"].last_update_time;
        assert!(t1 >= t0);

        s.update_status(StatusUpdate {
            bot_id: "b1".into(),
            credits: Some(100),
            ..Default::default()
        });
        let t2 = s.bots.read()["b1"].last_update_time;
        assert!(t2 >= t1);
    }

    #[test]
    fn status_update_unblocks_a_blocked_bot() {
        let s = state();
        insert_bot(&s, "b1");
        s.transition("b1", BotState::Running, None);
        s.transition("b1", BotState::Blocked, None);

        s.update_status(StatusUpdate {
            bot_id: "b1".into(),
            ..Default::default()
        });
        assert_eq!(s.bots.read()["b1"].state, BotState::Running);
    }

    #[test]
    fn snapshot_aggregates_by_state() {
        let s = state();
        for (id, st) in [
            ("b1", BotState::Running),
            ("b2", BotState::Running),
            ("b3", BotState::Completed),
            ("b4", BotState::Error),
        ] {
            insert_bot(&s, id);
            s.transition(id, BotState::Running, None);
            if st != BotState::Running {
                s.transition(id, st, None);
            }
        }

        let snapshot = s.build_status_snapshot();
        assert_eq!(snapshot["running"], 2);
        assert_eq!(snapshot["completed"], 1);
        assert_eq!(snapshot["errors"], 1);
        assert_eq!(snapshot["total_bots"], 4);
        assert_eq!(snapshot["bots"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn persistence_round_trip_never_resurrects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm_state.json");

        let s = state_with_file(path.clone());
        insert_bot(&s, "ran");
        s.transition("ran", BotState::Running, None);
        insert_bot(&s, "done");
        s.transition("done", BotState::Running, None);
        s.transition("done", BotState::Completed, None);
        s.flush_state().unwrap();

        let restored = state_with_file(path);
        restored.restore_state();
        let bots = restored.bots.read();
        // The running record came back stopped; the completed one intact.
        assert_eq!(bots["ran"].state, BotState::Stopped);
        assert!(bots["ran"].exit_reason.as_deref().unwrap().contains("not resurrected"));
        assert_eq!(bots["done"].state, BotState::Completed);
    }

    #[test]
    fn status_json_has_expected_fields() {
        let mut record = BotRecord::new("b9", "cfg.json");
        record.status.credits = Some(4242);
        record.status.strategy_id = "opportunistic".into();
        let value = record.to_status_json();
        assert_eq!(value["bot_id"], "b9");
        assert_eq!(value["state"], "queued");
        assert_eq!(value["credits"], 4242);
        assert_eq!(value["strategy_id"], "opportunistic");
        assert!(value["last_update_time"].is_f64());
    }

    #[test]
    fn hijack_bookkeeping() {
        let s = state();
        insert_bot(&s, "b1");
        s.set_hijack("b1", true, Some("ui-3".into()));
        {
            let bots = s.bots.read();
            assert!(bots["b1"].is_hijacked);
            assert_eq!(bots["b1"].hijacked_by.as_deref(), Some("ui-3"));
            assert!(bots["b1"].hijacked_at.is_some());
        }
        s.set_hijack("b1", false, None);
        assert!(!s.bots.read()["b1"].is_hijacked);
    }
}
