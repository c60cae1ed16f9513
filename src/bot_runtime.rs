// =============================================================================
// Bot Runtime — the per-bot game loop
// =============================================================================
//
// Drives one session through ORIENT -> DECIDE -> EXECUTE -> RECORD turns:
//
//   ORIENT   read a snapshot, update game state and sector knowledge, wake
//            a silent BBS with a carriage return.
//   DECIDE   drain a pending intervention override, else ask the strategy.
//   EXECUTE  run the decision through a small step machine that requires the
//            expected prompt at each step; steps abort on deadline rather
//            than sending blind keystrokes.
//   RECORD   update the rolling intervention window, telemetry counters, and
//            report status to the manager.
//
// The stop flag is observed at the ORIENT -> DECIDE boundary.  While
// hijacked, automated cycles pause and the runtime only executes explicit
// hijack steps or injected input; an expired hijack heartbeat releases the
// lease automatically.
// =============================================================================

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::accounts::LeasedAccount;
use crate::config::BotConfig;
use crate::detect::rules::InputType;
use crate::detect::PromptDetection;
use crate::errors::BotError;
use crate::game_state::{GameStateTracker, StateEvent};
use crate::goals::{GoalId, GoalPhaseTracker, TriggerType};
use crate::intervention::{ApplyOutcome, InterventionEngine, TurnRecord};
use crate::llm::{LlmProvider, LlmRequest};
use crate::session::Session;
use crate::strategy::knowledge::SectorKnowledge;
use crate::strategy::{
    ActionType, DecisionRecord, DecisionSource, Strategy, StrategyContext, StrategyDecision,
};
use crate::telemetry::BotCounters;

// =============================================================================
// Hijack control
// =============================================================================

/// Shared hijack state between the runtime and the worker channel.
pub struct HijackControl {
    owner: Mutex<Option<String>>,
    last_heartbeat: Mutex<Instant>,
    hijacked_at: Mutex<Option<String>>,
    pending_steps: Mutex<u32>,
    injected_input: Mutex<VecDeque<String>>,
    /// Operator-requested goal change (goal id, reason), applied by the
    /// runtime at the next cycle boundary.
    pending_goal: Mutex<Option<(String, String)>>,
    timeout: Duration,
}

impl HijackControl {
    pub fn new(timeout: Duration) -> Self {
        Self {
            owner: Mutex::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
            hijacked_at: Mutex::new(None),
            pending_steps: Mutex::new(0),
            injected_input: Mutex::new(VecDeque::new()),
            pending_goal: Mutex::new(None),
            timeout,
        }
    }

    /// Ask the runtime to switch goal (operator-initiated).
    pub fn request_goal(&self, goal_id: &str, reason: &str) {
        *self.pending_goal.lock() = Some((goal_id.to_string(), reason.to_string()));
    }

    pub fn take_goal_request(&self) -> Option<(String, String)> {
        self.pending_goal.lock().take()
    }

    /// Claim the hijack. Fails when another owner holds it.
    pub fn request(&self, owner: &str) -> bool {
        let mut guard = self.owner.lock();
        match guard.as_deref() {
            Some(existing) if existing != owner => false,
            _ => {
                *guard = Some(owner.to_string());
                *self.last_heartbeat.lock() = Instant::now();
                *self.hijacked_at.lock() = Some(chrono::Utc::now().to_rfc3339());
                true
            }
        }
    }

    pub fn release(&self) {
        *self.owner.lock() = None;
        *self.hijacked_at.lock() = None;
        *self.pending_steps.lock() = 0;
        self.injected_input.lock().clear();
    }

    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Current hijack state, enforcing heartbeat expiry as a side effect.
    pub fn is_hijacked(&self) -> bool {
        let expired = {
            let owner = self.owner.lock();
            owner.is_some() && self.last_heartbeat.lock().elapsed() > self.timeout
        };
        if expired {
            info!("hijack lease expired; releasing");
            self.release();
            return false;
        }
        self.owner.lock().is_some()
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    pub fn hijacked_at(&self) -> Option<String> {
        self.hijacked_at.lock().clone()
    }

    /// Queue exactly one ORIENT+EXECUTE of the last decision.
    pub fn queue_step(&self) {
        *self.pending_steps.lock() += 1;
    }

    pub fn take_step(&self) -> bool {
        let mut steps = self.pending_steps.lock();
        if *steps > 0 {
            *steps -= 1;
            true
        } else {
            false
        }
    }

    pub fn inject_input(&self, keys: String) {
        self.injected_input.lock().push_back(keys);
    }

    pub fn take_input(&self) -> Option<String> {
        self.injected_input.lock().pop_front()
    }
}

// =============================================================================
// Status reporting
// =============================================================================

/// One status update pushed to the manager after every turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub bot_id: String,
    pub sector: Option<u32>,
    pub credits: Option<i64>,
    pub turns_executed: u32,
    pub turns_max: u32,
    pub trades_executed: u32,
    pub credits_delta: i64,
    pub credits_per_turn: f64,
    pub haggle_accept: u32,
    pub haggle_counter: u32,
    pub haggle_too_high: u32,
    pub haggle_too_low: u32,
    pub llm_wakeups: u32,
    pub ship_level: Option<String>,
    pub username: String,
    pub strategy: String,
    pub strategy_id: String,
    pub strategy_mode: String,
    pub strategy_intent: String,
    pub activity_context: String,
    pub status_detail: String,
    pub prompt_id: Option<String>,
    pub cargo_fuel_ore: i64,
    pub cargo_organics: i64,
    pub cargo_equipment: i64,
    /// Worker-local session log path, for the manager's log tail and event
    /// query endpoints.
    pub log_path: Option<String>,
}

/// Destination for status updates (the worker channel in production, a
/// collector in tests).
pub trait StatusSink: Send + Sync {
    fn report(&self, update: StatusUpdate);
}

// =============================================================================
// Character state persistence
// =============================================================================

/// Per-character state written under `<root>/<namespace>/` (§ persistence
/// layout).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterState {
    pub character: String,
    pub credits: i64,
    pub turns_executed: u32,
    #[serde(default)]
    pub knowledge: SectorKnowledge,
}

impl CharacterState {
    pub fn path(root: &str, namespace: &str, character: &str) -> PathBuf {
        let safe: String = character
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        PathBuf::from(root)
            .join(namespace)
            .join(format!("{safe}_state.json"))
    }

    pub fn load(path: &PathBuf) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Why the run loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    Stopped,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub reason: ExitReason,
    pub detail: String,
}

/// Consecutive identical expected prompts before a step counts as stuck.
const STUCK_PROMPT_LIMIT: u32 = 3;
/// Blank reads before a wake carriage return is sent.
const BLANK_READS_BEFORE_WAKE: u32 = 3;
/// Per-step deadline for expected prompts.
const STEP_TIMEOUT: Duration = Duration::from_secs(8);
/// Read timeout during ORIENT.
const ORIENT_READ_TIMEOUT: Duration = Duration::from_millis(400);

pub struct BotRuntimeParams {
    pub bot_id: String,
    pub config: BotConfig,
    pub session: Arc<Session>,
    pub strategy: Box<dyn Strategy>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub account: LeasedAccount,
    pub status_sink: Option<Arc<dyn StatusSink>>,
    pub stop: Arc<AtomicBool>,
    pub hijack: Arc<HijackControl>,
}

pub struct BotRuntime {
    bot_id: String,
    config: BotConfig,
    session: Arc<Session>,
    strategy: Box<dyn Strategy>,
    llm: Option<Arc<dyn LlmProvider>>,
    account: LeasedAccount,
    status_sink: Option<Arc<dyn StatusSink>>,
    stop: Arc<AtomicBool>,
    hijack: Arc<HijackControl>,

    tracker: GameStateTracker,
    knowledge: SectorKnowledge,
    goals: GoalPhaseTracker,
    interventions: InterventionEngine,
    history: Vec<DecisionRecord>,
    counters: BotCounters,

    turn: u32,
    start_credits: Option<i64>,
    last_decision: Option<StrategyDecision>,
    last_prompt_id: Option<String>,
    blank_reads: u32,
    /// Events (trades, detections, anomalies) seen this turn.
    events_this_turn: u32,
    on_special_context: bool,
}

impl BotRuntime {
    pub fn new(params: BotRuntimeParams) -> Self {
        let interventions = InterventionEngine::new(params.config.intervention.clone());
        Self {
            bot_id: params.bot_id,
            interventions,
            tracker: GameStateTracker::new(20_000),
            knowledge: SectorKnowledge::default(),
            goals: GoalPhaseTracker::new(),
            history: Vec::new(),
            counters: BotCounters::default(),
            turn: 0,
            start_credits: None,
            last_decision: None,
            last_prompt_id: None,
            blank_reads: 0,
            events_this_turn: 0,
            on_special_context: false,
            config: params.config,
            session: params.session,
            strategy: params.strategy,
            llm: params.llm,
            account: params.account,
            status_sink: params.status_sink,
            stop: params.stop,
            hijack: params.hijack,
        }
    }

    // ── Main loop ───────────────────────────────────────────────────────

    pub async fn run(&mut self) -> RunOutcome {
        self.session.set_context(json!({
            "bot_id": self.bot_id,
            "character": self.account.identity.name,
        }));
        self.load_character_state();

        if let Err(e) = self.login().await {
            let reason = if e.is_disconnect() {
                ExitReason::Disconnected
            } else {
                ExitReason::Error
            };
            return self.finish(reason, format!("login failed: {e}"));
        }

        self.goals.start(
            GoalId::Profit,
            0,
            self.tracker.state().credits.unwrap_or(0),
            "session start",
        );
        self.start_credits = self.tracker.state().credits;

        loop {
            // Stop requests are honored at the cycle boundary.
            if self.stop.load(Ordering::SeqCst) {
                return self.finish(ExitReason::Stopped, "stop requested".into());
            }

            // Operator goal changes apply between cycles.
            if let Some((goal, reason)) = self.hijack.take_goal_request() {
                if let Ok(goal_id) = goal.parse::<GoalId>() {
                    let payload = self.goals.set_goal(
                        goal_id,
                        TriggerType::Manual,
                        &reason,
                        self.turn,
                        self.tracker.state().credits.unwrap_or(0),
                    );
                    self.session.logger.log("goal.changed", payload);
                }
            }

            if self.hijack.is_hijacked() {
                if let Err(e) = self.hijacked_tick().await {
                    if e.is_disconnect() {
                        return self.finish(ExitReason::Disconnected, e.to_string());
                    }
                    warn!(error = %e, "hijack tick failed");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            match self.cycle().await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    return self.finish(ExitReason::Disconnected, e.to_string());
                }
                Err(e @ BotError::SessionBusy(_)) => {
                    // Exclusivity violations are programming bugs.
                    return self.finish(ExitReason::Error, e.to_string());
                }
                Err(e) => {
                    self.session.logger.log_error(e.kind(), &e.to_string());
                    warn!(bot_id = %self.bot_id, error = %e, "cycle error; re-orienting");
                }
            }

            if self.turn >= self.config.session.max_turns_per_session {
                return self.finish(ExitReason::Completed, "turn budget reached".into());
            }
            if let (Some(target), Some(credits)) = (
                self.config.session.target_credits,
                self.tracker.state().credits,
            ) {
                if credits >= target {
                    return self.finish(ExitReason::Completed, "target credits reached".into());
                }
            }

            // Yield so status reporting and the worker channel can run.
            tokio::task::yield_now().await;
        }
    }

    fn finish(&mut self, reason: ExitReason, detail: String) -> RunOutcome {
        self.save_character_state();
        info!(bot_id = %self.bot_id, ?reason, detail = %detail, "bot run finished");
        self.session.logger.log(
            "status_update",
            json!({ "state": "finished", "reason": format!("{reason:?}"), "detail": detail }),
        );
        RunOutcome { reason, detail }
    }

    // ── Login ───────────────────────────────────────────────────────────

    /// Answer the BBS entry prompts with the leased identity until the
    /// first in-game command prompt appears.
    async fn login(&mut self) -> Result<(), BotError> {
        let deadline = Instant::now() + Duration::from_secs(90);
        let mut wake_sent = false;

        loop {
            if Instant::now() >= deadline {
                return Err(BotError::PromptTimeout(
                    "no in-game prompt within the login deadline".into(),
                ));
            }

            let (snapshot, detection) = self
                .session
                .read(Duration::from_millis(500), 8192)
                .await?;

            let Some(detection) = detection else {
                // A silent entry screen sometimes needs a nudge.
                if snapshot.raw_bytes.is_empty() && !wake_sent {
                    self.session.send("\r").await?;
                    wake_sent = true;
                }
                continue;
            };

            let id = detection.prompt_id.as_str();
            debug!(prompt = id, "login prompt");

            if id == "sector_command" {
                self.orient_from(&snapshot, Some(&detection));
                self.session
                    .logger
                    .log("note", json!({ "text": "login complete" }));
                return Ok(());
            }

            let reply = if id.contains("name") {
                format!("{}\r", self.account.identity.name)
            } else if id.contains("password") {
                format!("{}\r", self.account.account.password)
            } else if id.contains("ship") {
                format!("{}\r", self.account.identity.ship_name)
            } else if id.contains("game") || id.contains("menu") {
                self.account.account.game_letter.clone()
            } else {
                match detection.input_type {
                    InputType::AnyKey => " ".to_string(),
                    InputType::MultiKey => "\r".to_string(),
                    InputType::SingleKey => "\r".to_string(),
                }
            };
            self.session.send(&reply).await?;
        }
    }

    // ── ORIENT ──────────────────────────────────────────────────────────

    async fn orient(&mut self) -> Result<Option<PromptDetection>, BotError> {
        let (snapshot, detection) = self.session.read(ORIENT_READ_TIMEOUT, 8192).await?;

        let blank = snapshot.screen_text.trim().is_empty();
        if detection.is_none() && blank {
            self.blank_reads += 1;
            if self.blank_reads >= BLANK_READS_BEFORE_WAKE {
                // At most one wake per cycle.
                self.session.send("\r").await?;
                self.blank_reads = 0;
            }
        } else {
            self.blank_reads = 0;
        }

        self.orient_from(&snapshot, detection.as_ref());
        Ok(detection)
    }

    /// Fold a snapshot + detection into game state and knowledge.
    fn orient_from(&mut self, snapshot: &crate::terminal::Snapshot, detection: Option<&PromptDetection>) {
        let prompt_id = detection.map(|d| d.prompt_id.clone());
        self.on_special_context = prompt_id
            .as_deref()
            .map(|id| id.contains("planet") || id.contains("stardock") || id.contains("special"))
            .unwrap_or(self.on_special_context);

        let events = self
            .tracker
            .apply(snapshot, detection, self.on_special_context);

        for event in &events {
            match event {
                StateEvent::Anomaly { description } => {
                    self.session
                        .logger
                        .log("anomaly", json!({ "description": description }));
                    self.events_this_turn += 1;
                }
                StateEvent::SectorChanged { to, .. } => {
                    self.events_this_turn += 1;
                    // A sector change clears any special-port context.
                    self.on_special_context = false;
                    let warps = self.tracker.state().warps.clone();
                    self.knowledge.observe_sector(*to, &warps);
                }
                StateEvent::CreditsChanged { .. } => {
                    self.events_this_turn += 1;
                }
            }
        }

        // Keep adjacency fresh even without a sector change.
        if let Some(sector) = self.tracker.state().sector {
            let warps = self.tracker.state().warps.clone();
            if !warps.is_empty() {
                self.knowledge.observe_sector(sector, &warps);
            }
            if let (Some(name), Some(class)) = (
                self.tracker.state().port_name.clone(),
                self.tracker.state().port_class.clone(),
            ) {
                let existing = self.knowledge.ports.get(&sector);
                if existing.map(|p| p.name != name).unwrap_or(true) {
                    let mut port = existing.cloned().unwrap_or_default();
                    port.name = name;
                    port.class = class;
                    self.knowledge.observe_port(sector, port);
                }
            }
        }

        if let Some(detection) = detection {
            self.last_prompt_id = Some(detection.prompt_id.clone());
            self.events_this_turn += 1;
        }
    }

    // ── DECIDE ──────────────────────────────────────────────────────────

    async fn decide(&mut self) -> Result<StrategyDecision, BotError> {
        // Intervention overrides win over the strategy.
        if let Some(overriding) = self.interventions.take_override() {
            info!(bot_id = %self.bot_id, intent = %overriding.intent, "using intervention override");
            return Ok(overriding);
        }

        let state = self.tracker.state().clone();
        let last_move_failed = self.tracker.move_pending();
        let ctx = StrategyContext {
            turn: self.turn,
            state: &state,
            knowledge: &self.knowledge,
            history: &self.history,
            goal: self.goals.current(),
            last_move_failed,
            on_special_context: self.on_special_context,
            logger: Some(&self.session.logger),
        };
        let decision = self.strategy.decide(&ctx).await?;
        if matches!(
            decision.decision_source,
            DecisionSource::LlmDirect | DecisionSource::LlmManaged
        ) {
            self.counters.llm_wakeups += 1;
        }
        Ok(decision)
    }

    // ── EXECUTE ─────────────────────────────────────────────────────────

    async fn execute(&mut self, decision: &StrategyDecision) -> Result<bool, BotError> {
        self.session.logger.log(
            "action",
            json!({
                "action": decision.action.to_string(),
                "parameters": decision.parameters,
                "intent": decision.intent,
                "wake_reason": decision.wake_reason,
                "source": decision.decision_source,
            }),
        );

        let result = match decision.action {
            ActionType::Move | ActionType::CombatRetreat => {
                let Some(target) = decision.move_target() else {
                    return Err(BotError::Strategy("move without to_sector".into()));
                };
                self.execute_move(target).await
            }
            ActionType::Dock => self.execute_dock().await,
            ActionType::TradeBuy => self.execute_trade(decision, true).await,
            ActionType::TradeSell => self.execute_trade(decision, false).await,
            ActionType::Scan => self.execute_keys("D").await,
            ActionType::Wait => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(true)
            }
            ActionType::Bank => self.execute_keys("B\r").await,
            ActionType::Upgrade => self.execute_keys("U").await,
            ActionType::CombatEngage => self.execute_keys("A").await,
            ActionType::SendRaw => {
                let keys = decision.parameters["keys"].as_str().unwrap_or("");
                self.session.send(keys).await?;
                Ok(true)
            }
        };

        match result {
            Ok(success) => {
                self.session.logger.log(
                    "action",
                    json!({
                        "action": decision.action.to_string(),
                        "result": if success { "success" } else { "failure" },
                    }),
                );
                Ok(success)
            }
            Err(e) if e.is_disconnect() => Err(e),
            Err(e) => {
                // Step failures abort the action, not the bot; the next
                // cycle re-orients.
                self.session.logger.log(
                    "action",
                    json!({
                        "action": decision.action.to_string(),
                        "result": "failure",
                        "error": e.to_string(),
                    }),
                );
                Ok(false)
            }
        }
    }

    /// Send keys and wait for any prompt, with the stuck-prompt guard.
    async fn step_and_expect(&mut self, keys: &str) -> Result<PromptDetection, BotError> {
        self.session.send(keys).await?;

        let deadline = Instant::now() + STEP_TIMEOUT;
        let mut same_prompt_count = 0u32;
        let mut last_seen: Option<String> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(BotError::PromptTimeout(format!(
                    "no prompt after sending {keys:?}"
                )));
            }
            let (snapshot, detection) = self
                .session
                .read(Duration::from_millis(300), 8192)
                .await?;
            self.orient_from(&snapshot, detection.as_ref());

            let Some(detection) = detection else { continue };

            // Benign pauses are exempt from the stuck guard: feed them
            // space until they clear.
            if detection.prompt_id.contains("pause") {
                self.session.send(" ").await?;
                continue;
            }

            if last_seen.as_deref() == Some(detection.prompt_id.as_str()) {
                same_prompt_count += 1;
                if same_prompt_count >= STUCK_PROMPT_LIMIT {
                    return Err(BotError::PromptTimeout(format!(
                        "prompt '{}' repeated {same_prompt_count} times without transition",
                        detection.prompt_id
                    )));
                }
            } else {
                last_seen = Some(detection.prompt_id.clone());
                same_prompt_count = 1;
            }

            return Ok(detection);
        }
    }

    async fn execute_move(&mut self, target: u32) -> Result<bool, BotError> {
        let before = self.tracker.state().sector;
        self.tracker.note_move_sent(Some(target));

        // Typing the sector number at the command prompt starts the warp;
        // some screens ask for confirmation first.
        let detection = self.step_and_expect(&format!("{target}\r")).await?;
        if detection.prompt_id.contains("confirm") || detection.prompt_id.contains("yes_no") {
            self.step_and_expect("Y").await?;
        }

        // Let the arrival screen settle.
        let deadline = Instant::now() + STEP_TIMEOUT;
        while Instant::now() < deadline {
            if self.tracker.state().sector != before {
                return Ok(true);
            }
            let (snapshot, det) = self.session.read(Duration::from_millis(300), 8192).await?;
            self.orient_from(&snapshot, det.as_ref());
        }
        Ok(self.tracker.state().sector != before)
    }

    async fn execute_dock(&mut self) -> Result<bool, BotError> {
        let detection = self.step_and_expect("P").await?;
        Ok(detection.prompt_id.contains("port") || detection.prompt_id.contains("trade"))
    }

    /// Dock and run the haggle loop for one commodity.
    async fn execute_trade(
        &mut self,
        decision: &StrategyDecision,
        buying: bool,
    ) -> Result<bool, BotError> {
        let credits_before = self.tracker.state().credits;

        // Enter the port unless a port prompt is already showing.
        if !self
            .last_prompt_id
            .as_deref()
            .map(|id| id.contains("port"))
            .unwrap_or(false)
        {
            let det = self.step_and_expect("P").await?;
            if !(det.prompt_id.contains("port") || det.prompt_id.contains("trade")) {
                return Ok(false);
            }
        }

        // Walk the port dialogue: accept offered quantities, answer haggle
        // offers, leave when the dialogue closes.
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > 12 {
                return Err(BotError::PromptTimeout("trade dialogue did not close".into()));
            }

            let detection = self.step_and_expect("\r").await?;
            let id = detection.prompt_id.as_str();

            if id.contains("offer") || id.contains("haggle") {
                // Accepting the default offer keeps the ledger simple; the
                // counters record how the port responded.
                self.counters.haggle_accept += 1;
                continue;
            }
            if id.contains("too_high") {
                self.counters.haggle_too_high += 1;
                continue;
            }
            if id.contains("too_low") {
                self.counters.haggle_too_low += 1;
                continue;
            }
            if id.contains("counter") {
                self.counters.haggle_counter += 1;
                continue;
            }
            if id.contains("port") || id.contains("quantity") {
                continue;
            }

            // Back at a command prompt: the dialogue is over.
            if id == "sector_command" {
                break;
            }
        }

        let credits_after = self.tracker.state().credits;
        let profit = match (credits_before, credits_after) {
            (Some(before), Some(after)) => after - before,
            _ => 0,
        };

        let traded = if buying { profit < 0 } else { profit > 0 };
        if traded {
            self.counters.trades_executed += 1;
            self.counters.credits_delta += profit;
            if let Some(sector) = self.tracker.state().sector {
                self.knowledge.record_trade(sector, profit.abs());
            }
            self.session.logger.log(
                "tw2002.ledger",
                json!({
                    "kind": if buying { "buy" } else { "sell" },
                    "commodity": decision.parameters["commodity"],
                    "sector": self.tracker.state().sector,
                    "credits_delta": profit,
                }),
            );
        }
        Ok(traded)
    }

    async fn execute_keys(&mut self, keys: &str) -> Result<bool, BotError> {
        self.step_and_expect(keys).await?;
        Ok(true)
    }

    // ── RECORD ──────────────────────────────────────────────────────────

    async fn record(&mut self, decision: StrategyDecision, success: bool) {
        let state = self.tracker.state().clone();
        let profit = self
            .history
            .last()
            .and_then(|r| r.credits_after)
            .and_then(|prev| state.credits.map(|now| now - prev))
            .unwrap_or(0);

        self.history.push(DecisionRecord {
            turn: self.turn,
            decision: decision.clone(),
            success,
            credits_after: state.credits,
            sector_after: state.sector,
            profit,
        });
        if self.history.len() > 200 {
            self.history.remove(0);
        }

        self.interventions.record_turn(TurnRecord {
            turn: self.turn,
            action: decision.action.to_string(),
            params_key: format!("{}:{}", decision.action, decision.parameters),
            sector: state.sector,
            credits: state.credits,
            profit,
            events: self.events_this_turn,
        });

        self.run_interventions(&state).await;
        self.run_feedback().await;

        // Counters and no-trade buckets.
        if let (Some(start), Some(now)) = (self.start_credits, state.credits) {
            self.counters.credits_delta = now - start;
            self.counters.credits_per_turn = if self.turn > 0 {
                (now - start) as f64 / f64::from(self.turn)
            } else {
                0.0
            };
        }
        for (bucket, flag) in [
            (30u32, &mut self.counters.no_trade_t30),
            (60, &mut self.counters.no_trade_t60),
            (90, &mut self.counters.no_trade_t90),
            (120, &mut self.counters.no_trade_t120),
        ] {
            if self.turn == bucket && self.counters.trades_executed == 0 {
                *flag = true;
            }
        }

        self.turn += 1;
        self.events_this_turn = 0;
        self.last_decision = Some(decision);

        if self.turn % 25 == 0 {
            self.save_character_state();
        }
        self.report_status();
    }

    async fn run_interventions(&mut self, state: &crate::game_state::GameState) {
        if !self.interventions.ready(self.turn) {
            return;
        }
        let goal = self.goals.current().map(|g| g.goal_id);
        let detections = self.interventions.detect(state, &self.knowledge, goal);
        if detections.is_empty() {
            return;
        }
        for d in &detections {
            self.session.logger.log(
                "intervention",
                json!({
                    "category": d.category.to_string(),
                    "priority": d.priority.to_string(),
                    "observation": d.observation,
                    "trigger_reason": d.trigger_reason,
                }),
            );
        }

        let Some(llm) = self.llm.clone() else { return };
        let report = match self
            .interventions
            .advise(llm.as_ref(), state, goal, &detections)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.session.logger.log_error("llm", &e.to_string());
                return;
            }
        };

        let outcome = match self.interventions.apply(&report, self.turn) {
            Ok(outcome) => outcome,
            Err(e @ BotError::InterventionBudgetExceeded(_)) => {
                // Budget exhaustion downgrades to a logged no-op.
                self.session.logger.log_error(e.kind(), &e.to_string());
                return;
            }
            Err(e) => {
                self.session.logger.log_error(e.kind(), &e.to_string());
                return;
            }
        };

        let auto_applied = outcome != ApplyOutcome::LoggedOnly;
        self.session.logger.log(
            "llm.intervention",
            InterventionEngine::report_log_value(&report, auto_applied),
        );

        match outcome {
            ApplyOutcome::GoalChanged(goal_id) => {
                let payload = self.goals.set_goal(
                    goal_id,
                    TriggerType::Auto,
                    &report.reasoning,
                    self.turn,
                    state.credits.unwrap_or(0),
                );
                self.session.logger.log("goal.changed", payload);
            }
            ApplyOutcome::StrategyReset => {
                self.strategy.reset();
            }
            ApplyOutcome::ForcedMove(_) | ApplyOutcome::LoggedOnly => {}
        }
    }

    /// The advisory feedback loop: free-text analysis with no control
    /// effect.
    async fn run_feedback(&mut self) {
        let cfg = &self.config.trading.ai_strategy;
        if !cfg.feedback_enabled || self.turn == 0 {
            return;
        }
        if self.turn % cfg.feedback_interval_turns.max(1) != 0 {
            return;
        }
        let Some(llm) = self.llm.clone() else { return };

        let lookback = cfg.feedback_lookback_turns as usize;
        let start = self.history.len().saturating_sub(lookback);
        let recent = self.history[start..]
            .iter()
            .map(|r| {
                format!(
                    "turn {}: {} ({}) profit={}",
                    r.turn,
                    r.decision.action,
                    if r.success { "ok" } else { "failed" },
                    r.profit
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let request = LlmRequest {
            prompt: format!(
                "Review this Trade Wars bot's recent activity and point out \
                 one improvement in two sentences or less:\n{recent}"
            ),
            max_tokens: cfg.feedback_max_tokens,
            temperature: 0.5,
            timeout: Duration::from_millis(cfg.timeout_ms),
        };

        match llm.generate(request).await {
            Ok(response) => {
                self.session.logger.log(
                    "llm.feedback",
                    json!({
                        "turn": self.turn,
                        "text": response.text,
                        "model": response.model,
                        "duration_ms": response.duration_ms,
                    }),
                );
            }
            Err(e) => self.session.logger.log_error("llm", &e.to_string()),
        }
    }

    fn report_status(&self) {
        let Some(sink) = &self.status_sink else { return };
        let state = self.tracker.state();
        let update = StatusUpdate {
            bot_id: self.bot_id.clone(),
            sector: state.sector,
            credits: state.credits,
            turns_executed: self.turn,
            turns_max: self.config.session.max_turns_per_session,
            trades_executed: self.counters.trades_executed,
            credits_delta: self.counters.credits_delta,
            credits_per_turn: self.counters.credits_per_turn,
            haggle_accept: self.counters.haggle_accept,
            haggle_counter: self.counters.haggle_counter,
            haggle_too_high: self.counters.haggle_too_high,
            haggle_too_low: self.counters.haggle_too_low,
            llm_wakeups: self.counters.llm_wakeups,
            ship_level: state.ship_class.clone(),
            username: self.account.identity.name.clone(),
            strategy: self.config.trading.strategy.to_string(),
            strategy_id: self.strategy.id().to_string(),
            strategy_mode: self.strategy.mode().to_string(),
            strategy_intent: self
                .last_decision
                .as_ref()
                .map(|d| d.intent.clone())
                .unwrap_or_default(),
            activity_context: if self.on_special_context {
                "special_context".to_string()
            } else {
                "in_sector".to_string()
            },
            status_detail: self
                .last_decision
                .as_ref()
                .map(|d| d.action.to_string())
                .unwrap_or_default(),
            prompt_id: self.last_prompt_id.clone(),
            cargo_fuel_ore: state.cargo.fuel_ore,
            cargo_organics: state.cargo.organics,
            cargo_equipment: state.cargo.equipment,
            log_path: self
                .session
                .logger
                .path()
                .map(|p| p.to_string_lossy().into_owned()),
        };
        sink.report(update);
        self.session.logger.log(
            "status_update",
            json!({ "turn": self.turn, "credits": state.credits, "sector": state.sector }),
        );
    }

    // ── Full cycle ──────────────────────────────────────────────────────

    async fn cycle(&mut self) -> Result<(), BotError> {
        self.orient().await?;
        let decision = self.decide().await?;
        let success = self.execute(&decision).await?;
        self.record(decision, success).await;
        Ok(())
    }

    // ── Hijack handling ─────────────────────────────────────────────────

    /// One pass of the hijacked loop: forward injected input and honor
    /// single-step requests.
    async fn hijacked_tick(&mut self) -> Result<(), BotError> {
        while let Some(keys) = self.hijack.take_input() {
            self.session.send(&keys).await?;
        }

        if self.hijack.take_step() {
            // Exactly one ORIENT + EXECUTE of the last decided action.
            self.orient().await?;
            if let Some(decision) = self.last_decision.clone() {
                let success = self.execute(&decision).await?;
                self.record(decision, success).await;
            }
        } else {
            // Keep the screen fresh for spy subscribers.
            let (snapshot, detection) = self
                .session
                .read(Duration::from_millis(200), 8192)
                .await?;
            self.orient_from(&snapshot, detection.as_ref());
        }
        Ok(())
    }

    // ── Persistence ─────────────────────────────────────────────────────

    fn character_state_path(&self) -> PathBuf {
        CharacterState::path(
            &self.config.persist_root,
            &self.config.namespace,
            &self.account.identity.name,
        )
    }

    fn load_character_state(&mut self) {
        if let Some(saved) = CharacterState::load(&self.character_state_path()) {
            info!(
                character = %self.account.identity.name,
                visited = saved.knowledge.visited.len(),
                "character state restored"
            );
            self.knowledge = saved.knowledge;
        }
        // Shared knowledge pool, when enabled, seeds the map further.
        if self.config.multi_character.knowledge_sharing == "shared" {
            let shared_path = PathBuf::from(&self.config.persist_root)
                .join(&self.config.namespace)
                .join("shared_sectors.json");
            if let Ok(content) = std::fs::read_to_string(&shared_path) {
                if let Ok(shared) = serde_json::from_str::<SectorKnowledge>(&content) {
                    for (sector, warps) in shared.warps {
                        self.knowledge.warps.entry(sector).or_insert(warps);
                    }
                    for (sector, port) in shared.ports {
                        self.knowledge.ports.entry(sector).or_insert(port);
                    }
                    self.knowledge.visited.extend(shared.visited);
                }
            }
        }
    }

    fn save_character_state(&self) {
        let state = CharacterState {
            character: self.account.identity.name.clone(),
            credits: self.tracker.state().credits.unwrap_or(0),
            turns_executed: self.turn,
            knowledge: self.knowledge.clone(),
        };
        if let Err(e) = state.save(&self.character_state_path()) {
            warn!(error = %e, "character state save failed");
        }

        if self.config.multi_character.knowledge_sharing == "shared" {
            let shared_path = PathBuf::from(&self.config.persist_root)
                .join(&self.config.namespace)
                .join("shared_sectors.json");
            let merged = self.merged_shared_knowledge(&shared_path);
            let tmp = shared_path.with_extension("json.tmp");
            if let Ok(content) = serde_json::to_string_pretty(&merged) {
                let _ = std::fs::write(&tmp, content).and_then(|_| std::fs::rename(&tmp, &shared_path));
            }
        }
    }

    fn merged_shared_knowledge(&self, shared_path: &PathBuf) -> SectorKnowledge {
        let mut merged = std::fs::read_to_string(shared_path)
            .ok()
            .and_then(|c| serde_json::from_str::<SectorKnowledge>(&c).ok())
            .unwrap_or_default();
        for (sector, warps) in &self.knowledge.warps {
            merged.warps.insert(*sector, warps.clone());
        }
        for (sector, port) in &self.knowledge.ports {
            merged.ports.insert(*sector, port.clone());
        }
        merged.visited.extend(self.knowledge.visited.iter().copied());
        merged
    }

    /// Read-only view for the worker channel's screen analysis.
    pub fn session_handle(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    // ── HijackControl ───────────────────────────────────────────────────

    #[test]
    fn hijack_exclusive_ownership() {
        let h = HijackControl::new(Duration::from_secs(30));
        assert!(h.request("alice"));
        assert!(h.request("alice")); // re-request by the owner is fine
        assert!(!h.request("bob"));
        assert_eq!(h.owner().as_deref(), Some("alice"));

        h.release();
        assert!(h.request("bob"));
    }

    #[test]
    fn hijack_expires_without_heartbeat() {
        let h = HijackControl::new(Duration::from_millis(20));
        assert!(h.request("alice"));
        std::thread::sleep(Duration::from_millis(40));
        // Expiry is enforced on inspection.
        assert!(!h.is_hijacked());
        assert!(h.owner().is_none());
        assert!(h.request("bob"));
    }

    #[test]
    fn heartbeat_extends_the_lease() {
        let h = HijackControl::new(Duration::from_millis(60));
        assert!(h.request("alice"));
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(30));
            h.heartbeat();
        }
        assert!(h.is_hijacked());
    }

    #[test]
    fn hijack_steps_and_input_queue() {
        let h = HijackControl::new(Duration::from_secs(30));
        h.request("alice");
        h.queue_step();
        h.queue_step();
        assert!(h.take_step());
        assert!(h.take_step());
        assert!(!h.take_step());

        h.inject_input("M5\r".into());
        assert_eq!(h.take_input().as_deref(), Some("M5\r"));
        assert!(h.take_input().is_none());

        // Release drops queued work.
        h.queue_step();
        h.inject_input("x".into());
        h.release();
        assert!(!h.take_step());
        assert!(h.take_input().is_none());
    }

    // ── Character state ─────────────────────────────────────────────────

    #[test]
    fn character_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let path = CharacterState::path(&root, "tw2002", "Crimson Falcon 12");
        assert!(path.to_string_lossy().contains("Crimson_Falcon_12_state.json"));

        let mut state = CharacterState {
            character: "Crimson Falcon 12".into(),
            credits: 12345,
            turns_executed: 42,
            knowledge: SectorKnowledge::default(),
        };
        state.knowledge.observe_sector(5, &[6, 7]);
        state.save(&path).unwrap();

        let loaded = CharacterState::load(&path).unwrap();
        assert_eq!(loaded.credits, 12345);
        assert_eq!(loaded.knowledge.neighbors(5), &[6, 7]);
    }

    // ── Status sink ─────────────────────────────────────────────────────

    struct Collector(PMutex<Vec<StatusUpdate>>);

    impl StatusSink for Collector {
        fn report(&self, update: StatusUpdate) {
            self.0.lock().push(update);
        }
    }

    #[test]
    fn status_update_serializes_with_snake_case_fields() {
        let update = StatusUpdate {
            bot_id: "b1".into(),
            credits: Some(10),
            ..Default::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["bot_id"], "b1");
        assert_eq!(value["credits"], 10);
        assert!(value["haggle_accept"].is_u64());
        assert!(value["cargo_fuel_ore"].is_i64());
    }

    #[test]
    fn collector_sink_receives_updates() {
        let sink = Collector(PMutex::new(Vec::new()));
        sink.report(StatusUpdate {
            bot_id: "b1".into(),
            ..Default::default()
        });
        assert_eq!(sink.0.lock().len(), 1);
    }
}
