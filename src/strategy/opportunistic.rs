// =============================================================================
// Opportunistic — explore-biased wandering with forced trading
// =============================================================================
//
// With probability `explore_chance` the bot moves to a random unvisited
// neighbor.  Otherwise it docks at the current port when that looks
// profitable, or follows the neighbor with the best historical profit.
// A wander guard forces a trade attempt after too many consecutive
// explore steps so the bot never drifts forever.
// =============================================================================

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::debug;

use super::{
    apply_shared_guards, escape_target, ActionType, Strategy, StrategyContext, StrategyDecision,
};
use crate::config::OpportunisticConfig;
use crate::errors::BotError;

pub struct Opportunistic {
    config: OpportunisticConfig,
    rng: StdRng,
    /// Consecutive explore steps since the last trade.
    wander_steps: u32,
}

impl Opportunistic {
    pub fn new(config: OpportunisticConfig, seed: Option<u64>) -> Self {
        Self {
            config,
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
            wander_steps: 0,
        }
    }

    /// Current port looks worth docking at: known trading port, or a port
    /// visible on screen that is not special-class.
    fn port_is_promising(&self, ctx: &StrategyContext<'_>) -> bool {
        if let Some(port) = ctx.state.sector.and_then(|s| ctx.knowledge.ports.get(&s)) {
            return !port.is_special();
        }
        match ctx.state.port_class.as_deref() {
            Some(class) => !matches!(class, "0" | "9"),
            None => false,
        }
    }

    fn best_historical_neighbor(&self, ctx: &StrategyContext<'_>) -> Option<u32> {
        let neighbors: Vec<u32> = ctx
            .state
            .sector
            .map(|s| ctx.knowledge.neighbors(s).to_vec())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| ctx.state.warps.clone());

        neighbors
            .iter()
            .copied()
            .max_by_key(|s| {
                ctx.knowledge
                    .ports
                    .get(s)
                    .map(|p| p.best_profit)
                    .unwrap_or(0)
            })
            .or_else(|| neighbors.first().copied())
    }
}

#[async_trait]
impl Strategy for Opportunistic {
    fn id(&self) -> &str {
        "opportunistic"
    }

    async fn decide(&mut self, ctx: &StrategyContext<'_>) -> Result<StrategyDecision, BotError> {
        if ctx.on_special_context {
            let target = escape_target(ctx).ok_or_else(|| {
                BotError::Strategy("no escape route from special context".into())
            })?;
            return Ok(apply_shared_guards(
                ctx,
                StrategyDecision::new(
                    ActionType::Move,
                    json!({ "to_sector": target }),
                    self.id(),
                    "special_context_escape",
                    &format!("escaping to sector {target}"),
                ),
            ));
        }

        let must_trade = self.wander_steps >= self.config.max_wander_without_trade;
        let explore_roll: f64 = self.rng.gen();

        // Explore branch: random unvisited neighbor.
        if !must_trade && explore_roll < self.config.explore_chance {
            let unvisited = ctx
                .state
                .sector
                .map(|s| ctx.knowledge.unvisited_neighbors(s))
                .unwrap_or_default();
            if !unvisited.is_empty() {
                let pick = unvisited[self.rng.gen_range(0..unvisited.len())];
                self.wander_steps += 1;
                debug!(pick, wander = self.wander_steps, "opportunistic explore");
                return Ok(apply_shared_guards(
                    ctx,
                    StrategyDecision::new(
                        ActionType::Move,
                        json!({ "to_sector": pick }),
                        self.id(),
                        "explore_roll",
                        &format!("exploring unvisited sector {pick}"),
                    ),
                ));
            }
        }

        // Trade branch: dock here when the port looks worthwhile.
        if self.port_is_promising(ctx) {
            self.wander_steps = 0;
            let sector = ctx.state.sector.unwrap_or(0);
            return Ok(apply_shared_guards(
                ctx,
                StrategyDecision::new(
                    ActionType::Dock,
                    json!({ "sector": sector }),
                    self.id(),
                    if must_trade { "wander_guard" } else { "port_here" },
                    &format!("docking at sector {sector} port"),
                ),
            ));
        }

        // Otherwise chase the most profitable known neighbor.
        match self.best_historical_neighbor(ctx) {
            Some(to) => {
                self.wander_steps = self.wander_steps.saturating_add(1);
                Ok(apply_shared_guards(
                    ctx,
                    StrategyDecision::new(
                        ActionType::Move,
                        json!({ "to_sector": to }),
                        self.id(),
                        "follow_profit",
                        &format!("moving toward best-known neighbor {to}"),
                    ),
                ))
            }
            None => Ok(apply_shared_guards(
                ctx,
                StrategyDecision::new(
                    ActionType::Scan,
                    json!({}),
                    self.id(),
                    "no_neighbors",
                    "no known warps; scanning",
                ),
            )),
        }
    }

    fn reset(&mut self) {
        self.wander_steps = 0;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_state::GameState;
    use crate::strategy::knowledge::{PortKnowledge, SectorKnowledge};
    use crate::strategy::StrategyContext;

    fn ctx<'a>(state: &'a GameState, k: &'a SectorKnowledge) -> StrategyContext<'a> {
        StrategyContext {
            turn: 1,
            state,
            knowledge: k,
            history: &[],
            goal: None,
            last_move_failed: false,
            on_special_context: false,
            logger: None,
        }
    }

    #[tokio::test]
    async fn always_explores_with_chance_one() {
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2, 3]);
        let mut state = GameState::default();
        state.sector = Some(1);
        state.warps = vec![2, 3];

        let mut s = Opportunistic::new(
            OpportunisticConfig {
                explore_chance: 1.0,
                max_wander_without_trade: 99,
            },
            Some(7),
        );
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::Move);
        assert!(matches!(d.move_target(), Some(2) | Some(3)));
    }

    #[tokio::test]
    async fn never_explores_with_chance_zero_and_port_present() {
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2]);
        k.observe_port(
            1,
            PortKnowledge {
                name: "Vega".into(),
                class: "3".into(),
                trades: 1,
                ..Default::default()
            },
        );
        let mut state = GameState::default();
        state.sector = Some(1);

        let mut s = Opportunistic::new(
            OpportunisticConfig {
                explore_chance: 0.0,
                max_wander_without_trade: 8,
            },
            Some(7),
        );
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::Dock);
    }

    #[tokio::test]
    async fn wander_guard_forces_trade_attempt() {
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2]);
        k.observe_port(
            1,
            PortKnowledge {
                name: "Vega".into(),
                class: "3".into(),
                trades: 1,
                ..Default::default()
            },
        );
        // Sector 2 is unvisited so the explore branch would normally win.
        let mut state = GameState::default();
        state.sector = Some(1);

        let mut s = Opportunistic::new(
            OpportunisticConfig {
                explore_chance: 1.0,
                max_wander_without_trade: 0,
            },
            Some(7),
        );
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::Dock);
        assert_eq!(d.wake_reason, "wander_guard");
    }

    #[tokio::test]
    async fn follows_best_historical_profit() {
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2, 3]);
        // Both visited; sector 3's port has the better history.
        k.visited.insert(2);
        k.visited.insert(3);
        k.observe_port(
            2,
            PortKnowledge {
                class: "1".into(),
                best_profit: 50,
                trades: 1,
                ..Default::default()
            },
        );
        k.observe_port(
            3,
            PortKnowledge {
                class: "2".into(),
                best_profit: 800,
                trades: 3,
                ..Default::default()
            },
        );
        let mut state = GameState::default();
        state.sector = Some(1);

        let mut s = Opportunistic::new(
            OpportunisticConfig {
                explore_chance: 0.0,
                max_wander_without_trade: 8,
            },
            Some(7),
        );
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::Move);
        assert_eq!(d.move_target(), Some(3));
    }

    #[tokio::test]
    async fn reset_clears_wander_counter() {
        let mut s = Opportunistic::new(OpportunisticConfig::default(), Some(1));
        s.wander_steps = 5;
        s.reset();
        assert_eq!(s.wander_steps, 0);
    }
}
