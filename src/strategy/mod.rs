// =============================================================================
// Strategy Core — per-cycle decision making
// =============================================================================
//
// A strategy looks at the freshest game state plus recent history and emits
// exactly one StrategyDecision per cycle.  Every decision carries a
// wake_reason and a human-readable intent for observability.
//
// Shared guards enforced here, after the concrete strategy has decided:
//   - no trade unless the bot is in the intended trade sector,
//   - dock at a special-class (non-trading) port downgrades to a move,
//   - a move whose sector did not change escalates to a different neighbor.
// =============================================================================

pub mod ai;
pub mod knowledge;
pub mod opportunistic;
pub mod profitable_pairs;
pub mod twerk;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::TradingConfig;
use crate::errors::BotError;
use crate::game_state::GameState;
use crate::goals::GoalPhase;
use crate::llm::LlmProvider;
use crate::session::logger::SessionLogger;
use knowledge::SectorKnowledge;

// =============================================================================
// Decision types
// =============================================================================

/// The action chosen for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Move,
    TradeBuy,
    TradeSell,
    Dock,
    Scan,
    Wait,
    Bank,
    Upgrade,
    CombatEngage,
    CombatRetreat,
    SendRaw,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Move => "move",
            Self::TradeBuy => "trade_buy",
            Self::TradeSell => "trade_sell",
            Self::Dock => "dock",
            Self::Scan => "scan",
            Self::Wait => "wait",
            Self::Bank => "bank",
            Self::Upgrade => "upgrade",
            Self::CombatEngage => "combat_engage",
            Self::CombatRetreat => "combat_retreat",
            Self::SendRaw => "send_raw",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "move" => Ok(Self::Move),
            "trade_buy" => Ok(Self::TradeBuy),
            "trade_sell" => Ok(Self::TradeSell),
            "dock" => Ok(Self::Dock),
            "scan" => Ok(Self::Scan),
            "wait" => Ok(Self::Wait),
            "bank" => Ok(Self::Bank),
            "upgrade" => Ok(Self::Upgrade),
            "combat_engage" => Ok(Self::CombatEngage),
            "combat_retreat" => Ok(Self::CombatRetreat),
            "send_raw" => Ok(Self::SendRaw),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Rule,
    LlmManaged,
    LlmDirect,
    SupervisorAutopilot,
    GoalContract,
    Fallback,
}

/// One cycle's choice, with full provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub action: ActionType,
    #[serde(default)]
    pub parameters: Value,
    /// Why the bot woke up / acted now.
    pub wake_reason: String,
    pub decision_source: DecisionSource,
    pub strategy_id: String,
    pub strategy_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_after_turns: Option<u32>,
    /// Short human-readable note for the dashboard.
    pub intent: String,
}

impl StrategyDecision {
    pub fn new(
        action: ActionType,
        parameters: Value,
        strategy_id: &str,
        wake_reason: &str,
        intent: &str,
    ) -> Self {
        Self {
            action,
            parameters,
            wake_reason: wake_reason.to_string(),
            decision_source: DecisionSource::Rule,
            strategy_id: strategy_id.to_string(),
            strategy_mode: "rule".to_string(),
            review_after_turns: None,
            intent: intent.to_string(),
        }
    }

    /// Destination sector for move decisions.
    pub fn move_target(&self) -> Option<u32> {
        self.parameters["to_sector"].as_u64().map(|v| v as u32)
    }
}

/// Outcome of executing one decision, kept in the rolling history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub turn: u32,
    pub decision: StrategyDecision,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_after: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_after: Option<u32>,
    /// Credits delta attributable to this turn.
    #[serde(default)]
    pub profit: i64,
}

// =============================================================================
// Strategy context and trait
// =============================================================================

/// Everything a strategy may consult when deciding.
pub struct StrategyContext<'a> {
    pub turn: u32,
    pub state: &'a GameState,
    pub knowledge: &'a SectorKnowledge,
    pub history: &'a [DecisionRecord],
    pub goal: Option<&'a GoalPhase>,
    /// The last move did not change the sector.
    pub last_move_failed: bool,
    /// The bot sits on a home planet / special port and must escape before
    /// trading.
    pub on_special_context: bool,
    /// Session logger for llm.* events; absent in pure unit tests.
    pub logger: Option<&'a SessionLogger>,
}

/// A pluggable decision engine. One instance per bot.
#[async_trait]
pub trait Strategy: Send {
    fn id(&self) -> &str;

    /// "rule", "llm", or "fallback" — surfaced in status reports.
    fn mode(&self) -> &str {
        "rule"
    }

    async fn decide(&mut self, ctx: &StrategyContext<'_>) -> Result<StrategyDecision, BotError>;

    /// Reinitialize internal counters and caches (intervention
    /// reset_strategy).
    fn reset(&mut self);
}

// =============================================================================
// Shared guards
// =============================================================================

/// Post-process a raw decision with the invariants every strategy must obey.
pub fn apply_shared_guards(ctx: &StrategyContext<'_>, decision: StrategyDecision) -> StrategyDecision {
    // Trades only execute in the sector the strategy intended.
    if matches!(decision.action, ActionType::TradeBuy | ActionType::TradeSell) {
        let intended = decision.parameters["sector"].as_u64().map(|v| v as u32);
        if let (Some(intended), Some(current)) = (intended, ctx.state.sector) {
            if intended != current {
                debug!(intended, current, "trade out of intended sector downgraded to move");
                return StrategyDecision {
                    action: ActionType::Move,
                    parameters: json!({ "to_sector": intended }),
                    wake_reason: "trade_sector_mismatch".to_string(),
                    intent: format!("reposition to sector {intended} before trading"),
                    ..decision
                };
            }
        }
    }

    // Docking at a special-class port is invalid; abort into a move.
    if decision.action == ActionType::Dock {
        let is_special = ctx
            .state
            .sector
            .and_then(|s| ctx.knowledge.ports.get(&s))
            .map(|p| p.is_special())
            .unwrap_or(false)
            || ctx
                .state
                .port_class
                .as_deref()
                .map(|c| matches!(c, "0" | "9"))
                .unwrap_or(false);
        if is_special {
            let target = escape_target(ctx);
            debug!(?target, "dock at special port downgraded to move");
            return StrategyDecision {
                action: ActionType::Move,
                parameters: json!({ "to_sector": target }),
                wake_reason: "special_port_abort".to_string(),
                intent: "abort docking at non-trading port".to_string(),
                ..decision
            };
        }
    }

    // A failed move must not be retried into the same wall.
    if decision.action == ActionType::Move && ctx.last_move_failed {
        let last_target = ctx
            .history
            .last()
            .filter(|r| r.decision.action == ActionType::Move)
            .and_then(|r| r.decision.move_target());
        if decision.move_target() == last_target && last_target.is_some() {
            let alternative = ctx
                .state
                .warps
                .iter()
                .copied()
                .find(|&w| Some(w) != last_target);
            if let Some(alt) = alternative {
                debug!(alt, "failed move escalated to a different neighbor");
                return StrategyDecision {
                    action: ActionType::Move,
                    parameters: json!({ "to_sector": alt }),
                    wake_reason: "move_escalation".to_string(),
                    intent: format!("previous move failed; trying sector {alt}"),
                    ..decision
                };
            }
            // No alternative neighbor known: re-orient instead of moving.
            return StrategyDecision {
                action: ActionType::Scan,
                parameters: json!({}),
                wake_reason: "move_escalation".to_string(),
                intent: "previous move failed; re-orienting".to_string(),
                ..decision
            };
        }
    }

    decision
}

/// Pick an escape hop from a home planet / special port: prefer a neighbor
/// with a known trading port, then any warp.
pub fn escape_target(ctx: &StrategyContext<'_>) -> Option<u32> {
    let neighbors = ctx
        .state
        .sector
        .map(|s| ctx.knowledge.neighbors(s).to_vec())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| ctx.state.warps.clone());

    neighbors
        .iter()
        .copied()
        .find(|s| {
            ctx.knowledge
                .ports
                .get(s)
                .map(|p| p.has_trade_data() && !p.is_special())
                .unwrap_or(false)
        })
        .or_else(|| neighbors.first().copied())
}

// =============================================================================
// Factory
// =============================================================================

/// Build the configured strategy for a bot.
pub fn build_strategy(
    config: &TradingConfig,
    llm: Option<Arc<dyn LlmProvider>>,
) -> Box<dyn Strategy> {
    use crate::config::StrategyKind;

    match config.strategy {
        StrategyKind::ProfitablePairs => Box::new(profitable_pairs::ProfitablePairs::new(
            config.profitable_pairs.clone(),
        )),
        StrategyKind::Opportunistic => Box::new(opportunistic::Opportunistic::new(
            config.opportunistic.clone(),
            None,
        )),
        StrategyKind::TwerkOptimized => {
            Box::new(twerk::TwerkOptimized::new(config.twerk_optimized.clone()))
        }
        StrategyKind::AiStrategy => {
            let fallback = build_fallback(config);
            match llm {
                Some(provider) => Box::new(ai::AiStrategy::new(
                    config.ai_strategy.clone(),
                    provider,
                    fallback,
                )),
                // No provider configured: run the fallback directly.
                None => fallback,
            }
        }
    }
}

fn build_fallback(config: &TradingConfig) -> Box<dyn Strategy> {
    match config.ai_strategy.fallback_strategy.as_str() {
        "opportunistic" => Box::new(opportunistic::Opportunistic::new(
            config.opportunistic.clone(),
            None,
        )),
        "twerk_optimized" => Box::new(twerk::TwerkOptimized::new(config.twerk_optimized.clone())),
        _ => Box::new(profitable_pairs::ProfitablePairs::new(
            config.profitable_pairs.clone(),
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use knowledge::PortKnowledge;

    fn ctx_fixture<'a>(
        state: &'a GameState,
        knowledge: &'a SectorKnowledge,
        history: &'a [DecisionRecord],
    ) -> StrategyContext<'a> {
        StrategyContext {
            turn: 1,
            state,
            knowledge,
            history,
            goal: None,
            last_move_failed: false,
            on_special_context: false,
            logger: None,
        }
    }

    #[test]
    fn trade_outside_intended_sector_downgrades_to_move() {
        let mut state = GameState::default();
        state.sector = Some(10);
        let knowledge = SectorKnowledge::default();
        let ctx = ctx_fixture(&state, &knowledge, &[]);

        let decision = StrategyDecision::new(
            ActionType::TradeBuy,
            json!({ "sector": 12, "commodity": "fuel_ore" }),
            "test",
            "cycle",
            "buy ore",
        );
        let guarded = apply_shared_guards(&ctx, decision);
        assert_eq!(guarded.action, ActionType::Move);
        assert_eq!(guarded.move_target(), Some(12));
    }

    #[test]
    fn dock_at_special_port_downgrades() {
        let mut state = GameState::default();
        state.sector = Some(1);
        state.port_class = Some("9".to_string());
        state.warps = vec![2, 3];
        let mut knowledge = SectorKnowledge::default();
        knowledge.observe_sector(1, &[2, 3]);
        let ctx = ctx_fixture(&state, &knowledge, &[]);

        let decision =
            StrategyDecision::new(ActionType::Dock, json!({}), "test", "cycle", "dock");
        let guarded = apply_shared_guards(&ctx, decision);
        assert_eq!(guarded.action, ActionType::Move);
    }

    #[test]
    fn repeated_failed_move_escalates_to_other_neighbor() {
        let mut state = GameState::default();
        state.sector = Some(1);
        state.warps = vec![2, 3];
        let knowledge = SectorKnowledge::default();

        let prior = DecisionRecord {
            turn: 1,
            decision: StrategyDecision::new(
                ActionType::Move,
                json!({ "to_sector": 2 }),
                "test",
                "cycle",
                "go",
            ),
            success: false,
            credits_after: None,
            sector_after: Some(1),
            profit: 0,
        };
        let history = vec![prior];
        let mut ctx = ctx_fixture(&state, &knowledge, &history);
        ctx.last_move_failed = true;

        let retry = StrategyDecision::new(
            ActionType::Move,
            json!({ "to_sector": 2 }),
            "test",
            "cycle",
            "go again",
        );
        let guarded = apply_shared_guards(&ctx, retry);
        assert_eq!(guarded.move_target(), Some(3));
    }

    #[test]
    fn escape_prefers_known_trading_neighbor() {
        let mut state = GameState::default();
        state.sector = Some(1);
        let mut knowledge = SectorKnowledge::default();
        knowledge.observe_sector(1, &[2, 3]);
        knowledge.observe_port(
            3,
            PortKnowledge {
                name: "Vega".into(),
                class: "2".into(),
                trades: 1,
                ..Default::default()
            },
        );
        let ctx = ctx_fixture(&state, &knowledge, &[]);
        assert_eq!(escape_target(&ctx), Some(3));
    }

    #[test]
    fn action_type_round_trips_through_str() {
        for action in [
            ActionType::Move,
            ActionType::TradeBuy,
            ActionType::CombatRetreat,
            ActionType::SendRaw,
        ] {
            let s = action.to_string();
            assert_eq!(s.parse::<ActionType>().unwrap(), action);
        }
    }
}
