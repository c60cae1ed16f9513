// =============================================================================
// Intervention Engine — anomaly and opportunity detection with LLM analysis
// =============================================================================
//
// Watches the rolling per-turn history for loops, stagnation, and decline,
// and the live game state for opportunities (big trades nearby, combat
// readiness, banking).  Detections above the configured priority may be sent
// to the LLM advisor; an accepted recommendation is applied by pushing an
// override into a bounded queue that the bot runtime drains at DECIDE time —
// the engine never calls into the strategy directly.
//
// A cooldown suppresses back-to-back interventions and a per-session budget
// hard-caps them.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::InterventionConfig;
use crate::errors::BotError;
use crate::game_state::GameState;
use crate::goals::GoalId;
use crate::llm::{LlmProvider, LlmRequest};
use crate::strategy::knowledge::SectorKnowledge;
use crate::strategy::{ActionType, DecisionSource, StrategyDecision};

// =============================================================================
// Types
// =============================================================================

/// Severity tiers, ordered. The config's "medium" spelling maps to Warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Info,
    Warning,
    High,
    Critical,
}

impl Priority {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "info" => Self::Info,
            "high" => Self::High,
            "critical" => Self::Critical,
            // "medium" and "warning" are the same tier.
            _ => Self::Warning,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// What kind of condition a detector saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ActionLoop,
    SectorLoop,
    GoalStagnation,
    PerformanceDecline,
    TurnWaste,
    CompleteStagnation,
    HighValueTrade,
    CombatReady,
    BankingOptimal,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ActionLoop => "action_loop",
            Self::SectorLoop => "sector_loop",
            Self::GoalStagnation => "goal_stagnation",
            Self::PerformanceDecline => "performance_decline",
            Self::TurnWaste => "turn_waste",
            Self::CompleteStagnation => "complete_stagnation",
            Self::HighValueTrade => "high_value_trade",
            Self::CombatReady => "combat_ready",
            Self::BankingOptimal => "banking_optimal",
        };
        write!(f, "{s}")
    }
}

/// One observed turn, pushed into the rolling window after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub action: String,
    /// Stable key of action + parameters for loop comparison.
    pub params_key: String,
    pub sector: Option<u32>,
    pub credits: Option<i64>,
    pub profit: i64,
    /// Count of notable events this turn (trades, prompts, anomalies).
    pub events: u32,
}

/// A raw detector hit before any LLM involvement.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub category: Category,
    pub priority: Priority,
    pub confidence: f64,
    pub observation: String,
    pub evidence: Vec<String>,
    pub trigger_reason: String,
}

/// The advisor's structured verdict (§ LLM intervention advisor contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionReport {
    pub severity: String,
    pub category: String,
    pub observation: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    /// continue | adjust_goal | manual_review | direct_intervention
    pub recommendation: String,
    #[serde(default)]
    pub suggested_action: SuggestedAction,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestedAction {
    /// change_goal | reset_strategy | force_move | none
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub parameters: Value,
}

/// What applying a report asks the runtime to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    GoalChanged(GoalId),
    StrategyReset,
    /// A move override was queued for the next DECIDE.
    ForcedMove(u32),
    LoggedOnly,
}

// =============================================================================
// Engine
// =============================================================================

/// Rolling-window size kept regardless of individual detector windows.
const WINDOW_CAP: usize = 120;
/// Override queue bound; excess overrides are dropped oldest-first.
const OVERRIDE_CAP: usize = 4;
/// Turns with identical sector+credits+no events that count as frozen.
const FROZEN_WINDOW: usize = 10;

pub struct InterventionEngine {
    config: InterventionConfig,
    min_priority: Priority,
    window: VecDeque<TurnRecord>,
    /// No new interventions until this turn.
    cooldown_until: u32,
    /// Interventions emitted this session (budget).
    emitted: u32,
    /// Overrides awaiting the runtime's DECIDE step.
    overrides: VecDeque<StrategyDecision>,
}

impl InterventionEngine {
    pub fn new(config: InterventionConfig) -> Self {
        let min_priority = Priority::parse(&config.min_priority);
        Self {
            config,
            min_priority,
            window: VecDeque::new(),
            cooldown_until: 0,
            emitted: 0,
            overrides: VecDeque::new(),
        }
    }

    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    /// Pop the next pending override, if any (drained at DECIDE time).
    pub fn take_override(&mut self) -> Option<StrategyDecision> {
        self.overrides.pop_front()
    }

    /// Record one completed turn.
    pub fn record_turn(&mut self, record: TurnRecord) {
        self.window.push_back(record);
        while self.window.len() > WINDOW_CAP {
            self.window.pop_front();
        }
    }

    /// Whether detection should run at all this turn.
    pub fn ready(&self, turn: u32) -> bool {
        self.config.enabled
            && turn >= self.cooldown_until
            && self.emitted < self.config.max_per_session
    }

    // ── Detectors ───────────────────────────────────────────────────────

    /// Run every detector; returns hits at or above min_priority.
    pub fn detect(
        &self,
        state: &GameState,
        knowledge: &SectorKnowledge,
        goal: Option<GoalId>,
    ) -> Vec<Detection> {
        let mut hits = Vec::new();

        if let Some(d) = self.detect_action_loop() {
            hits.push(d);
        }
        if let Some(d) = self.detect_sector_loop() {
            hits.push(d);
        }
        if let Some(d) = self.detect_goal_stagnation() {
            hits.push(d);
        }
        if let Some(d) = self.detect_performance_decline() {
            hits.push(d);
        }
        if let Some(d) = self.detect_turn_waste() {
            hits.push(d);
        }
        if let Some(d) = self.detect_complete_stagnation() {
            hits.push(d);
        }
        if let Some(d) = self.detect_high_value_trade(state, knowledge) {
            hits.push(d);
        }
        if let Some(d) = self.detect_combat_ready(state, goal) {
            hits.push(d);
        }
        if let Some(d) = self.detect_banking_optimal(state) {
            hits.push(d);
        }

        hits.retain(|d| d.priority >= self.min_priority);
        hits
    }

    fn detect_action_loop(&self) -> Option<Detection> {
        let threshold = self.config.loop_action_threshold as usize;
        if self.window.len() < threshold.max(2) {
            return None;
        }
        let recent: Vec<&TurnRecord> = self.window.iter().rev().take(threshold.max(4)).collect();

        // Straight repetition: the same action+params N times running.
        let head = &recent[0].params_key;
        let run = recent.iter().take_while(|r| &r.params_key == head).count();
        if run >= threshold {
            return Some(Detection {
                category: Category::ActionLoop,
                priority: Priority::High,
                confidence: 0.85,
                observation: format!("action '{}' repeated {run} times", recent[0].action),
                evidence: recent
                    .iter()
                    .take(run)
                    .map(|r| format!("turn {}: {}", r.turn, r.params_key))
                    .collect(),
                trigger_reason: "repeated identical action".to_string(),
            });
        }

        // Alternation: A-B-A-B over at least four turns.
        if recent.len() >= 4 {
            let (a, b) = (&recent[0].params_key, &recent[1].params_key);
            if a != b
                && recent
                    .iter()
                    .enumerate()
                    .take(4)
                    .all(|(i, r)| &r.params_key == if i % 2 == 0 { a } else { b })
            {
                return Some(Detection {
                    category: Category::ActionLoop,
                    priority: Priority::High,
                    confidence: 0.8,
                    observation: "alternating A-B-A-B action pattern".to_string(),
                    evidence: recent
                        .iter()
                        .take(4)
                        .map(|r| format!("turn {}: {}", r.turn, r.params_key))
                        .collect(),
                    trigger_reason: "alternating action loop".to_string(),
                });
            }
        }
        None
    }

    fn detect_sector_loop(&self) -> Option<Detection> {
        let threshold = self.config.loop_sector_threshold as usize;
        let lookback = (threshold * 2).max(8);
        if self.window.len() < threshold {
            return None;
        }
        let recent: Vec<&TurnRecord> = self.window.iter().rev().take(lookback).collect();
        let mut counts = std::collections::HashMap::new();
        for r in &recent {
            if let Some(sector) = r.sector {
                *counts.entry(sector).or_insert(0usize) += 1;
            }
        }
        let (&sector, &count) = counts.iter().max_by_key(|(_, &c)| c)?;
        if count >= threshold {
            return Some(Detection {
                category: Category::SectorLoop,
                priority: Priority::High,
                confidence: 0.8,
                observation: format!("sector {sector} visited {count} times in the last {lookback} turns"),
                evidence: vec![format!("visit count {count} >= threshold {threshold}")],
                trigger_reason: "sector revisit loop".to_string(),
            });
        }
        None
    }

    fn detect_goal_stagnation(&self) -> Option<Detection> {
        let span = self.config.stagnation_turns as usize;
        if self.window.len() < span {
            return None;
        }
        let now = self.window.back()?.credits?;
        let then = self.window[self.window.len() - span].credits?;
        let relative = (now - then).abs() as f64 / then.max(1) as f64;
        if relative < 0.05 {
            return Some(Detection {
                category: Category::GoalStagnation,
                priority: Priority::High,
                confidence: 0.75,
                observation: format!(
                    "credits moved {relative:.1}% over the last {span} turns ({then} -> {now})"
                ),
                evidence: vec![format!("relative change {relative:.4} < 0.05")],
                trigger_reason: "credits flat over stagnation window".to_string(),
            });
        }
        None
    }

    fn detect_performance_decline(&self) -> Option<Detection> {
        let span = (self.config.stagnation_turns as usize).max(10);
        if self.window.len() < span {
            return None;
        }
        let window: Vec<&TurnRecord> = self.window.iter().rev().take(span).collect();
        let half = span / 2;
        // window is newest-first: second_half = first `half` entries.
        let second: i64 = window[..half].iter().map(|r| r.profit).sum();
        let first: i64 = window[half..].iter().map(|r| r.profit).sum();
        let first_ppt = first as f64 / (span - half) as f64;
        let second_ppt = second as f64 / half as f64;

        if first_ppt > 0.0 && second_ppt < self.config.profit_decline_ratio * first_ppt {
            return Some(Detection {
                category: Category::PerformanceDecline,
                priority: Priority::Warning,
                confidence: 0.7,
                observation: format!(
                    "profit/turn fell from {first_ppt:.0} to {second_ppt:.0} across the window"
                ),
                evidence: vec![format!(
                    "second half {second_ppt:.1} < {} x first half {first_ppt:.1}",
                    self.config.profit_decline_ratio
                )],
                trigger_reason: "profit per turn declining".to_string(),
            });
        }
        None
    }

    fn detect_turn_waste(&self) -> Option<Detection> {
        let span = (self.config.stagnation_turns as usize).max(10);
        if self.window.len() < span {
            return None;
        }
        let window: Vec<&TurnRecord> = self.window.iter().rev().take(span).collect();
        let wasted = window.iter().filter(|r| r.profit <= 0).count();
        let fraction = wasted as f64 / span as f64;
        if fraction > self.config.turn_waste_threshold {
            return Some(Detection {
                category: Category::TurnWaste,
                priority: Priority::Warning,
                confidence: 0.7,
                observation: format!(
                    "{wasted} of the last {span} turns produced no profit ({:.0}%)",
                    fraction * 100.0
                ),
                evidence: vec![format!(
                    "waste fraction {fraction:.2} > {}",
                    self.config.turn_waste_threshold
                )],
                trigger_reason: "unprofitable turns".to_string(),
            });
        }
        None
    }

    fn detect_complete_stagnation(&self) -> Option<Detection> {
        if self.window.len() < FROZEN_WINDOW {
            return None;
        }
        let recent: Vec<&TurnRecord> = self.window.iter().rev().take(FROZEN_WINDOW).collect();
        let head = recent[0];
        let frozen = recent
            .iter()
            .all(|r| r.sector == head.sector && r.credits == head.credits && r.events == 0);
        if frozen {
            return Some(Detection {
                category: Category::CompleteStagnation,
                priority: Priority::Critical,
                confidence: 0.95,
                observation: format!(
                    "sector {:?} and credits {:?} unchanged with zero events for {FROZEN_WINDOW} turns",
                    head.sector, head.credits
                ),
                evidence: vec!["no state movement and no events".to_string()],
                trigger_reason: "bot appears frozen".to_string(),
            });
        }
        None
    }

    fn detect_high_value_trade(
        &self,
        state: &GameState,
        knowledge: &SectorKnowledge,
    ) -> Option<Detection> {
        let current = state.sector?;
        let (sector, profit) = knowledge
            .trading_ports_within(current, 3)
            .into_iter()
            .filter_map(|(sector, _)| {
                knowledge
                    .ports
                    .get(&sector)
                    .map(|p| (sector, p.best_profit))
            })
            .max_by_key(|&(_, profit)| profit)?;
        if profit >= self.config.high_value_trade_min {
            return Some(Detection {
                category: Category::HighValueTrade,
                priority: Priority::Info,
                confidence: 0.6,
                observation: format!("trade worth {profit} credits known at sector {sector}, within 3 hops"),
                evidence: vec![format!("port best_profit {profit}")],
                trigger_reason: "high value trade nearby".to_string(),
            });
        }
        None
    }

    fn detect_combat_ready(&self, state: &GameState, goal: Option<GoalId>) -> Option<Detection> {
        let fighters = state.fighters?;
        let shields = state.shields?;
        if fighters > self.config.combat_ready_fighters
            && shields > self.config.combat_ready_shields
            && goal != Some(GoalId::Combat)
        {
            return Some(Detection {
                category: Category::CombatReady,
                priority: Priority::Info,
                confidence: 0.6,
                observation: format!(
                    "{fighters} fighters and {shields} shields with a non-combat goal"
                ),
                evidence: vec![format!("fighters {fighters}, shields {shields}")],
                trigger_reason: "combat capacity unused".to_string(),
            });
        }
        None
    }

    fn detect_banking_optimal(&self, state: &GameState) -> Option<Detection> {
        let credits = state.credits?;
        // Sectors 1-10 are FedSpace; cash is safe there.
        let in_fedspace = state.sector.map(|s| s <= 10).unwrap_or(false);
        if credits > self.config.banking_threshold && !in_fedspace {
            return Some(Detection {
                category: Category::BankingOptimal,
                priority: Priority::Info,
                confidence: 0.6,
                observation: format!("carrying {credits} credits outside FedSpace"),
                evidence: vec![format!("credits {credits} > {}", self.config.banking_threshold)],
                trigger_reason: "large unbanked balance".to_string(),
            });
        }
        None
    }

    // ── LLM advisor ─────────────────────────────────────────────────────

    /// Ask the advisor what to do about `detections`.
    pub async fn advise(
        &self,
        provider: &dyn LlmProvider,
        state: &GameState,
        goal: Option<GoalId>,
        detections: &[Detection],
    ) -> Result<InterventionReport, BotError> {
        let detections_text = detections
            .iter()
            .map(|d| format!("- [{}] {}: {}", d.priority, d.category, d.observation))
            .collect::<Vec<_>>()
            .join("\n");

        let recent = self
            .window
            .iter()
            .rev()
            .take(10)
            .map(|r| {
                format!(
                    "turn {}: {} sector={:?} credits={:?} profit={}",
                    r.turn, r.action, r.sector, r.credits, r.profit
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You supervise an automated Trade Wars 2002 bot.\n\n\
             GAME STATE: sector={:?} credits={:?} goal={:?}\n\n\
             DETECTED CONDITIONS:\n{detections_text}\n\n\
             RECENT TURNS:\n{recent}\n\n\
             Reply with ONLY a JSON object:\n\
             {{\"severity\": \"critical|warning|info\", \"category\": \"<category>\", \
             \"observation\": \"...\", \"evidence\": [\"...\"], \
             \"recommendation\": \"continue|adjust_goal|manual_review|direct_intervention\", \
             \"suggested_action\": {{\"type\": \"change_goal|reset_strategy|force_move|none\", \
             \"parameters\": {{}}}}, \"reasoning\": \"...\", \"confidence\": 0.0}}",
            state.sector,
            state.credits,
            goal.map(|g| g.to_string()),
        );

        let response = provider
            .generate(LlmRequest {
                prompt,
                max_tokens: self.config.analysis_max_tokens,
                temperature: self.config.analysis_temperature,
                timeout: std::time::Duration::from_secs(30),
            })
            .await?;

        let cleaned = response
            .text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        serde_json::from_str(cleaned)
            .map_err(|e| BotError::Llm(format!("advisor reply is not valid JSON: {e}")))
    }

    // ── Application ─────────────────────────────────────────────────────

    /// Account for an intervention and apply its suggested action.  Fails
    /// with the budget error when the session cap is already spent; callers
    /// downgrade that to a logged no-op.
    pub fn apply(
        &mut self,
        report: &InterventionReport,
        turn: u32,
    ) -> Result<ApplyOutcome, BotError> {
        if self.emitted >= self.config.max_per_session {
            return Err(BotError::InterventionBudgetExceeded(self.emitted));
        }
        self.emitted += 1;
        self.cooldown_until = turn + self.config.cooldown_turns;

        if !self.config.auto_apply {
            info!(category = %report.category, "intervention recorded (auto_apply off)");
            return Ok(ApplyOutcome::LoggedOnly);
        }

        let outcome = match report.suggested_action.r#type.as_str() {
            "change_goal" => {
                let goal: GoalId = report.suggested_action.parameters["goal"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(GoalId::Exploration);
                ApplyOutcome::GoalChanged(goal)
            }
            "reset_strategy" => ApplyOutcome::StrategyReset,
            "force_move" => {
                let target = report.suggested_action.parameters["to_sector"]
                    .as_u64()
                    .map(|v| v as u32);
                match target {
                    Some(to) => {
                        self.push_override(StrategyDecision {
                            action: ActionType::Move,
                            parameters: json!({ "to_sector": to }),
                            wake_reason: "intervention_force_move".to_string(),
                            decision_source: DecisionSource::SupervisorAutopilot,
                            strategy_id: "intervention".to_string(),
                            strategy_mode: "override".to_string(),
                            review_after_turns: Some(self.config.cooldown_turns),
                            intent: format!("intervention: forced move to {to}"),
                        });
                        ApplyOutcome::ForcedMove(to)
                    }
                    None => {
                        warn!("force_move suggested without to_sector; logging only");
                        ApplyOutcome::LoggedOnly
                    }
                }
            }
            _ => ApplyOutcome::LoggedOnly,
        };

        debug!(?outcome, emitted = self.emitted, "intervention applied");
        Ok(outcome)
    }

    fn push_override(&mut self, decision: StrategyDecision) {
        if self.overrides.len() >= OVERRIDE_CAP {
            self.overrides.pop_front();
        }
        self.overrides.push_back(decision);
    }

    /// Log payload for `llm.intervention` events.
    pub fn report_log_value(report: &InterventionReport, auto_applied: bool) -> Value {
        json!({
            "severity": report.severity,
            "category": report.category,
            "observation": report.observation,
            "evidence": report.evidence,
            "recommendation": report.recommendation,
            "suggested_action": {
                "type": report.suggested_action.r#type,
                "parameters": report.suggested_action.parameters,
            },
            "reasoning": report.reasoning,
            "confidence": report.confidence,
            "auto_applied": auto_applied,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmProvider;

    fn engine(config: InterventionConfig) -> InterventionEngine {
        InterventionEngine::new(config)
    }

    fn turn(turn: u32, action: &str, params: &str, sector: u32, credits: i64, profit: i64) -> TurnRecord {
        TurnRecord {
            turn,
            action: action.to_string(),
            params_key: format!("{action}:{params}"),
            sector: Some(sector),
            credits: Some(credits),
            profit,
            events: 1,
        }
    }

    #[test]
    fn action_loop_fires_on_repetition() {
        let mut e = engine(InterventionConfig::default());
        for i in 0..3 {
            e.record_turn(turn(i, "move", "5", 5, 1000, 0));
        }
        let hits = e.detect(&GameState::default(), &SectorKnowledge::default(), None);
        assert!(hits.iter().any(|d| d.category == Category::ActionLoop));
        let hit = hits.iter().find(|d| d.category == Category::ActionLoop).unwrap();
        assert_eq!(hit.priority, Priority::High);
        assert!(!hit.evidence.is_empty());
    }

    #[test]
    fn action_loop_fires_on_alternation() {
        let mut e = engine(InterventionConfig::default());
        for i in 0..4 {
            let params = if i % 2 == 0 { "5" } else { "6" };
            e.record_turn(turn(i, "move", params, 5, 1000, 0));
        }
        let hits = e.detect(&GameState::default(), &SectorKnowledge::default(), None);
        assert!(hits.iter().any(|d| d.category == Category::ActionLoop));
    }

    #[test]
    fn sector_loop_fires_on_revisits() {
        let mut e = engine(InterventionConfig::default());
        for i in 0..8 {
            let sector = if i % 2 == 0 { 5 } else { 6 };
            e.record_turn(turn(i, "move", &i.to_string(), sector, 1000 + i as i64, 1));
        }
        let hits = e.detect(&GameState::default(), &SectorKnowledge::default(), None);
        assert!(hits.iter().any(|d| d.category == Category::SectorLoop));
    }

    #[test]
    fn goal_stagnation_fires_on_flat_credits() {
        let mut e = engine(InterventionConfig::default());
        for i in 0..15 {
            e.record_turn(turn(i, "scan", &i.to_string(), i, 10_000 + (i % 2) as i64, 1));
        }
        let hits = e.detect(&GameState::default(), &SectorKnowledge::default(), None);
        assert!(hits.iter().any(|d| d.category == Category::GoalStagnation));
    }

    #[test]
    fn complete_stagnation_is_critical() {
        let mut e = engine(InterventionConfig::default());
        for i in 0..10 {
            let mut r = turn(i, "wait", "", 7, 500, 0);
            r.events = 0;
            e.record_turn(r);
        }
        let hits = e.detect(&GameState::default(), &SectorKnowledge::default(), None);
        let hit = hits
            .iter()
            .find(|d| d.category == Category::CompleteStagnation)
            .unwrap();
        assert_eq!(hit.priority, Priority::Critical);
        assert!((hit.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn min_priority_filters_info_detections() {
        let mut config = InterventionConfig::default();
        config.min_priority = "high".to_string();
        let e = engine(config);

        let mut state = GameState::default();
        state.sector = Some(50);
        state.credits = Some(500_000);
        // banking_optimal (info) must be filtered out.
        let hits = e.detect(&state, &SectorKnowledge::default(), None);
        assert!(hits.iter().all(|d| d.priority >= Priority::High));
    }

    #[test]
    fn combat_ready_respects_goal() {
        let e = engine(InterventionConfig::default());
        let mut state = GameState::default();
        state.fighters = Some(100);
        state.shields = Some(200);

        let hits = e.detect(&state, &SectorKnowledge::default(), None);
        assert!(hits.iter().any(|d| d.category == Category::CombatReady));

        let hits = e.detect(&state, &SectorKnowledge::default(), Some(GoalId::Combat));
        assert!(!hits.iter().any(|d| d.category == Category::CombatReady));
    }

    #[test]
    fn budget_exhaustion_errors() {
        let mut config = InterventionConfig::default();
        config.max_per_session = 1;
        config.auto_apply = false;
        let mut e = engine(config);

        let report = InterventionReport {
            severity: "warning".into(),
            category: "action_loop".into(),
            observation: "x".into(),
            evidence: vec![],
            recommendation: "continue".into(),
            suggested_action: SuggestedAction::default(),
            reasoning: String::new(),
            confidence: 0.5,
        };

        assert!(e.apply(&report, 1).is_ok());
        let err = e.apply(&report, 2).unwrap_err();
        assert!(matches!(err, BotError::InterventionBudgetExceeded(1)));
    }

    #[test]
    fn cooldown_suppresses_ready() {
        let mut config = InterventionConfig::default();
        config.cooldown_turns = 5;
        config.auto_apply = false;
        let mut e = engine(config);

        let report = InterventionReport {
            severity: "warning".into(),
            category: "turn_waste".into(),
            observation: "x".into(),
            evidence: vec![],
            recommendation: "continue".into(),
            suggested_action: SuggestedAction::default(),
            reasoning: String::new(),
            confidence: 0.5,
        };
        e.apply(&report, 10).unwrap();
        assert!(!e.ready(12));
        assert!(e.ready(15));
    }

    #[test]
    fn change_goal_and_force_move_apply() {
        let mut config = InterventionConfig::default();
        config.auto_apply = true;
        let mut e = engine(config);

        let mut report = InterventionReport {
            severity: "high".into(),
            category: "action_loop".into(),
            observation: "looping".into(),
            evidence: vec![],
            recommendation: "adjust_goal".into(),
            suggested_action: SuggestedAction {
                r#type: "change_goal".into(),
                parameters: json!({ "goal": "exploration" }),
            },
            reasoning: "stuck".into(),
            confidence: 0.8,
        };
        assert_eq!(
            e.apply(&report, 1).unwrap(),
            ApplyOutcome::GoalChanged(GoalId::Exploration)
        );

        report.suggested_action = SuggestedAction {
            r#type: "force_move".into(),
            parameters: json!({ "to_sector": 42 }),
        };
        assert_eq!(e.apply(&report, 10).unwrap(), ApplyOutcome::ForcedMove(42));
        let decision = e.take_override().unwrap();
        assert_eq!(decision.action, ActionType::Move);
        assert_eq!(decision.move_target(), Some(42));
        assert!(e.take_override().is_none());
    }

    #[tokio::test]
    async fn advisor_parses_scripted_reply() {
        let e = engine(InterventionConfig::default());
        let provider = ScriptedLlmProvider::always(
            r#"{"severity":"warning","category":"action_loop","observation":"bot is circling",
                "evidence":["turns 1-4 identical"],"recommendation":"adjust_goal",
                "suggested_action":{"type":"change_goal","parameters":{"goal":"exploration"}},
                "reasoning":"break the loop","confidence":0.7}"#,
        );
        let report = e
            .advise(&provider, &GameState::default(), Some(GoalId::Profit), &[])
            .await
            .unwrap();
        assert_eq!(report.recommendation, "adjust_goal");
        assert_eq!(report.suggested_action.r#type, "change_goal");
    }
}
