// =============================================================================
// ProfitablePairs — cached best round-trip trade route
// =============================================================================
//
// Scores every pair of known trading ports within the hop-distance limit and
// caches the best round trip by profit-per-turn.  Each cycle emits the
// cheapest next step along the cached route: move toward the buy port, buy,
// move to the sell port, sell, repeat.
//
// A bot parked on a home planet or special port first escapes to a neighbor
// with known trade data before any route work.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{
    apply_shared_guards, escape_target, ActionType, Strategy, StrategyContext, StrategyDecision,
};
use crate::config::ProfitablePairsConfig;
use crate::errors::BotError;
use crate::strategy::knowledge::Commodity;

/// One scored round trip between two ports.
#[derive(Debug, Clone, PartialEq)]
pub struct TradePair {
    pub buy_sector: u32,
    pub sell_sector: u32,
    pub commodity: Commodity,
    pub round_trip_hops: u32,
    pub profit_per_turn: i64,
}

pub struct ProfitablePairs {
    config: ProfitablePairsConfig,
    /// Best pair computed over the current knowledge.
    cached_pair: Option<TradePair>,
    /// Turn the cache was computed on; recomputed when knowledge grows.
    cached_at_ports: usize,
    /// True after buying, until the sell completes.
    holding_cargo: bool,
}

impl ProfitablePairs {
    pub fn new(config: ProfitablePairsConfig) -> Self {
        Self {
            config,
            cached_pair: None,
            cached_at_ports: 0,
            holding_cargo: false,
        }
    }

    /// Score all port pairs within the hop limit and keep the best.
    fn recompute(&mut self, ctx: &StrategyContext<'_>) {
        let k = ctx.knowledge;
        let mut best: Option<TradePair> = None;

        for (&a, port_a) in &k.ports {
            if port_a.is_special() || !port_a.has_trade_data() {
                continue;
            }
            for (&b, port_b) in &k.ports {
                if a == b || port_b.is_special() || !port_b.has_trade_data() {
                    continue;
                }
                // A commodity port_a sells that port_b buys.
                let Some(commodity) = port_a
                    .selling
                    .iter()
                    .copied()
                    .find(|c| port_b.buying.contains(c))
                else {
                    continue;
                };
                let Some(hops) = k.distance(a, b) else { continue };
                if hops == 0 || hops > self.config.max_hop_distance {
                    continue;
                }

                // Round trip: there and back, plus one turn per dock.
                let round_trip_hops = hops * 2;
                let turns = (round_trip_hops + 2) as i64;
                let gross = port_a.best_profit.max(port_b.best_profit).max(
                    // No observed profit yet: assume a conservative margin.
                    200,
                );
                let profit_per_turn = gross / turns;
                if profit_per_turn < self.config.min_profit_per_turn {
                    continue;
                }

                let candidate = TradePair {
                    buy_sector: a,
                    sell_sector: b,
                    commodity,
                    round_trip_hops,
                    profit_per_turn,
                };
                if best
                    .as_ref()
                    .map(|b| candidate.profit_per_turn > b.profit_per_turn)
                    .unwrap_or(true)
                {
                    best = Some(candidate);
                }
            }
        }

        debug!(pair = ?best, "profitable pair recomputed");
        self.cached_pair = best;
        self.cached_at_ports = k.ports.len();
    }

    fn step_decision(&mut self, ctx: &StrategyContext<'_>) -> StrategyDecision {
        let Some(pair) = self.cached_pair.clone() else {
            // Nothing profitable known yet: widen the map.
            let target = ctx
                .state
                .sector
                .map(|s| ctx.knowledge.unvisited_neighbors(s))
                .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
                .or_else(|| ctx.state.warps.first().copied());
            return match target {
                Some(to) => StrategyDecision::new(
                    ActionType::Move,
                    json!({ "to_sector": to }),
                    self.id(),
                    "no_profitable_pair",
                    &format!("exploring sector {to} for trade data"),
                ),
                None => StrategyDecision::new(
                    ActionType::Scan,
                    json!({}),
                    self.id(),
                    "no_profitable_pair",
                    "no known warps; scanning",
                ),
            };
        };

        let current = ctx.state.sector.unwrap_or(pair.buy_sector);
        let (target_sector, action, commodity) = if self.holding_cargo {
            (pair.sell_sector, ActionType::TradeSell, pair.commodity)
        } else {
            (pair.buy_sector, ActionType::TradeBuy, pair.commodity)
        };

        if current == target_sector {
            let verb = if self.holding_cargo { "sell" } else { "buy" };
            return StrategyDecision::new(
                action,
                json!({
                    "sector": target_sector,
                    "commodity": commodity.to_string(),
                }),
                self.id(),
                "route_step",
                &format!(
                    "{verb} {commodity} at sector {target_sector} ({} cr/turn)",
                    pair.profit_per_turn
                ),
            );
        }

        // Not at the trade port yet: take the cheapest next hop.
        let next = ctx
            .knowledge
            .path(current, target_sector)
            .and_then(|p| p.first().copied())
            .or_else(|| ctx.state.warps.first().copied());
        match next {
            Some(to) => StrategyDecision::new(
                ActionType::Move,
                json!({ "to_sector": to }),
                self.id(),
                "route_step",
                &format!("en route to sector {target_sector} via {to}"),
            ),
            None => StrategyDecision::new(
                ActionType::Scan,
                json!({}),
                self.id(),
                "route_unreachable",
                &format!("no path to sector {target_sector}; re-orienting"),
            ),
        }
    }

    /// Flip the buy/sell leg after a completed trade; called from outside
    /// through decision history inspection.
    fn sync_leg_from_history(&mut self, ctx: &StrategyContext<'_>) {
        if let Some(last) = ctx.history.last() {
            if last.success {
                match last.decision.action {
                    ActionType::TradeBuy => self.holding_cargo = true,
                    ActionType::TradeSell => self.holding_cargo = false,
                    _ => {}
                }
            }
        }
        // Cargo on board implies the buy leg happened even if history was
        // trimmed.
        let cargo = &ctx.state.cargo;
        if cargo.fuel_ore + cargo.organics + cargo.equipment > 0 {
            self.holding_cargo = true;
        }
    }
}

#[async_trait]
impl Strategy for ProfitablePairs {
    fn id(&self) -> &str {
        "profitable_pairs"
    }

    async fn decide(&mut self, ctx: &StrategyContext<'_>) -> Result<StrategyDecision, BotError> {
        // Home planet / special port: escape before route work.
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
                    &format!("escaping to sector {target} before trading"),
                ),
            ));
        }

        self.sync_leg_from_history(ctx);

        if self.cached_pair.is_none() || self.cached_at_ports != ctx.knowledge.ports.len() {
            self.recompute(ctx);
        }

        Ok(apply_shared_guards(ctx, self.step_decision(ctx)))
    }

    fn reset(&mut self) {
        self.cached_pair = None;
        self.cached_at_ports = 0;
        self.holding_cargo = false;
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

    fn trading_universe() -> SectorKnowledge {
        // 1 - 2 - 3; port at 1 sells fuel ore, port at 3 buys it.
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2]);
        k.observe_sector(2, &[1, 3]);
        k.observe_sector(3, &[2]);
        k.observe_port(
            1,
            PortKnowledge {
                name: "Ore Depot".into(),
                class: "2".into(),
                selling: vec![Commodity::FuelOre],
                best_profit: 900,
                trades: 2,
                ..Default::default()
            },
        );
        k.observe_port(
            3,
            PortKnowledge {
                name: "Refinery".into(),
                class: "4".into(),
                buying: vec![Commodity::FuelOre],
                best_profit: 900,
                trades: 1,
                ..Default::default()
            },
        );
        k
    }

    fn ctx<'a>(
        state: &'a GameState,
        k: &'a SectorKnowledge,
    ) -> StrategyContext<'a> {
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
    async fn buys_at_the_buy_port() {
        let k = trading_universe();
        let mut state = GameState::default();
        state.sector = Some(1);

        let mut s = ProfitablePairs::new(ProfitablePairsConfig {
            max_hop_distance: 5,
            min_profit_per_turn: 10,
        });
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::TradeBuy);
        assert_eq!(d.parameters["sector"], 1);
        assert!(!d.intent.is_empty());
        assert!(!d.wake_reason.is_empty());
    }

    #[tokio::test]
    async fn moves_along_path_toward_buy_port() {
        let k = trading_universe();
        let mut state = GameState::default();
        state.sector = Some(3);

        let mut s = ProfitablePairs::new(ProfitablePairsConfig {
            max_hop_distance: 5,
            min_profit_per_turn: 10,
        });
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::Move);
        assert_eq!(d.move_target(), Some(2));
    }

    #[tokio::test]
    async fn sells_after_cargo_loaded() {
        let k = trading_universe();
        let mut state = GameState::default();
        state.sector = Some(3);
        state.cargo.fuel_ore = 20;

        let mut s = ProfitablePairs::new(ProfitablePairsConfig {
            max_hop_distance: 5,
            min_profit_per_turn: 10,
        });
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::TradeSell);
        assert_eq!(d.parameters["sector"], 3);
    }

    #[tokio::test]
    async fn min_profit_filter_rejects_thin_routes() {
        let k = trading_universe();
        let mut state = GameState::default();
        state.sector = Some(1);
        state.warps = vec![2];

        let mut s = ProfitablePairs::new(ProfitablePairsConfig {
            max_hop_distance: 5,
            min_profit_per_turn: 100_000,
        });
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        // No pair qualifies; the strategy explores instead of trading.
        assert_ne!(d.action, ActionType::TradeBuy);
    }

    #[tokio::test]
    async fn escapes_special_context_first() {
        let k = trading_universe();
        let mut state = GameState::default();
        state.sector = Some(2);
        state.warps = vec![1, 3];

        let mut s = ProfitablePairs::new(ProfitablePairsConfig::default());
        let mut c = ctx(&state, &k);
        c.on_special_context = true;
        let d = s.decide(&c).await.unwrap();
        assert_eq!(d.action, ActionType::Move);
        // The escape hop targets a neighbor with known trade data.
        assert!(matches!(d.move_target(), Some(1) | Some(3)));
    }
}
