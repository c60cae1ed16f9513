// =============================================================================
// TwerkOptimized — routes from a precomputed trade-pair dump
// =============================================================================
//
// Consumes port/sector dumps extracted offline (`trade_pairs.json` under the
// configured data_dir) and selects the highest credits-per-turn route that
// intersects the bot's current sector.  Routes are reloaded and re-ranked
// every `recalculate_interval` turns so refreshed dumps take effect without
// a restart.
// =============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    apply_shared_guards, escape_target, ActionType, Strategy, StrategyContext, StrategyDecision,
};
use crate::config::TwerkConfig;
use crate::errors::BotError;
use crate::strategy::knowledge::Commodity;

// =============================================================================
// Dump format
// =============================================================================

/// One precomputed route from the offline dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpedPair {
    pub sector_a: u32,
    pub sector_b: u32,
    pub commodity: Commodity,
    /// Expected credits per turn for the full round trip.
    pub credits_per_turn: i64,
}

/// The `trade_pairs.json` file shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradePairsDump {
    #[serde(default)]
    pub pairs: Vec<DumpedPair>,
}

impl TradePairsDump {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

// =============================================================================
// Strategy
// =============================================================================

pub struct TwerkOptimized {
    config: TwerkConfig,
    pairs: Vec<DumpedPair>,
    /// Injected table for tests / in-memory use; skips file loading.
    injected: bool,
    last_loaded_turn: Option<u32>,
    /// Active route and which leg we are on.
    route: Option<DumpedPair>,
    holding_cargo: bool,
}

impl TwerkOptimized {
    pub fn new(config: TwerkConfig) -> Self {
        Self {
            config,
            pairs: Vec::new(),
            injected: false,
            last_loaded_turn: None,
            route: None,
            holding_cargo: false,
        }
    }

    /// Use an in-memory pair table instead of the file dump.
    pub fn with_pairs(config: TwerkConfig, pairs: Vec<DumpedPair>) -> Self {
        Self {
            config,
            pairs,
            injected: true,
            last_loaded_turn: None,
            route: None,
            holding_cargo: false,
        }
    }

    fn dump_path(&self) -> PathBuf {
        Path::new(&self.config.data_dir).join("trade_pairs.json")
    }

    fn maybe_reload(&mut self, turn: u32) {
        if self.injected {
            return;
        }
        let due = match self.last_loaded_turn {
            None => true,
            Some(at) => turn.saturating_sub(at) >= self.config.recalculate_interval.max(1),
        };
        if !due {
            return;
        }
        self.last_loaded_turn = Some(turn);

        match TradePairsDump::load(&self.dump_path()) {
            Ok(dump) => {
                debug!(pairs = dump.pairs.len(), "twerk dump reloaded");
                self.pairs = dump.pairs;
                self.route = None;
            }
            Err(e) => {
                warn!(path = %self.dump_path().display(), error = %e, "twerk dump load failed");
            }
        }
    }

    /// Best route whose endpoints include (or are reachable from) `sector`.
    fn pick_route(&self, ctx: &StrategyContext<'_>, sector: u32) -> Option<DumpedPair> {
        let reachable = |target: u32| {
            target == sector || ctx.knowledge.distance(sector, target).is_some()
        };
        self.pairs
            .iter()
            .filter(|p| reachable(p.sector_a) || reachable(p.sector_b))
            .max_by_key(|p| {
                // Prefer routes already intersecting the current sector.
                let intersects = (p.sector_a == sector || p.sector_b == sector) as i64;
                (intersects, p.credits_per_turn)
            })
            .cloned()
    }
}

#[async_trait]
impl Strategy for TwerkOptimized {
    fn id(&self) -> &str {
        "twerk_optimized"
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

        self.maybe_reload(ctx.turn);

        let current = ctx
            .state
            .sector
            .ok_or_else(|| BotError::Strategy("sector unknown; cannot route".into()))?;

        if self.route.is_none() {
            self.route = self.pick_route(ctx, current);
        }
        let Some(route) = self.route.clone() else {
            // No usable dump entry: fall back to widening the map.
            let target = ctx.state.warps.first().copied();
            return Ok(apply_shared_guards(
                ctx,
                match target {
                    Some(to) => StrategyDecision::new(
                        ActionType::Move,
                        json!({ "to_sector": to }),
                        self.id(),
                        "no_dump_route",
                        &format!("no dump route here; drifting to {to}"),
                    ),
                    None => StrategyDecision::new(
                        ActionType::Scan,
                        json!({}),
                        self.id(),
                        "no_dump_route",
                        "no dump route and no warps; scanning",
                    ),
                },
            ));
        };

        let cargo_total =
            ctx.state.cargo.fuel_ore + ctx.state.cargo.organics + ctx.state.cargo.equipment;
        if cargo_total > 0 {
            self.holding_cargo = true;
        }

        let (target_sector, action) = if self.holding_cargo {
            (route.sector_b, ActionType::TradeSell)
        } else {
            (route.sector_a, ActionType::TradeBuy)
        };

        if current == target_sector {
            if self.holding_cargo {
                self.holding_cargo = false;
            } else {
                self.holding_cargo = true;
            }
            return Ok(apply_shared_guards(
                ctx,
                StrategyDecision::new(
                    action,
                    json!({
                        "sector": target_sector,
                        "commodity": route.commodity.to_string(),
                    }),
                    self.id(),
                    "dump_route_step",
                    &format!(
                        "{} {} on dumped route ({} cr/turn)",
                        action, route.commodity, route.credits_per_turn
                    ),
                ),
            ));
        }

        let next = ctx
            .knowledge
            .path(current, target_sector)
            .and_then(|p| p.first().copied())
            .or_else(|| ctx.state.warps.first().copied());
        Ok(apply_shared_guards(
            ctx,
            match next {
                Some(to) => StrategyDecision::new(
                    ActionType::Move,
                    json!({ "to_sector": to }),
                    self.id(),
                    "dump_route_step",
                    &format!("heading to dumped route sector {target_sector} via {to}"),
                ),
                None => StrategyDecision::new(
                    ActionType::Scan,
                    json!({}),
                    self.id(),
                    "dump_route_unreachable",
                    &format!("no known path to {target_sector}; scanning"),
                ),
            },
        ))
    }

    fn reset(&mut self) {
        self.route = None;
        self.holding_cargo = false;
        self.last_loaded_turn = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_state::GameState;
    use crate::strategy::knowledge::SectorKnowledge;
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

    fn pairs() -> Vec<DumpedPair> {
        vec![
            DumpedPair {
                sector_a: 1,
                sector_b: 3,
                commodity: Commodity::Equipment,
                credits_per_turn: 300,
            },
            DumpedPair {
                sector_a: 7,
                sector_b: 8,
                commodity: Commodity::FuelOre,
                credits_per_turn: 900,
            },
        ]
    }

    #[tokio::test]
    async fn picks_route_intersecting_current_sector() {
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2]);
        k.observe_sector(2, &[1, 3]);
        k.observe_sector(3, &[2]);
        let mut state = GameState::default();
        state.sector = Some(1);

        // The 7-8 route pays better but is unreachable from sector 1.
        let mut s = TwerkOptimized::with_pairs(TwerkConfig::default(), pairs());
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::TradeBuy);
        assert_eq!(d.parameters["sector"], 1);
    }

    #[tokio::test]
    async fn loads_dump_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dump = TradePairsDump { pairs: pairs() };
        std::fs::write(
            dir.path().join("trade_pairs.json"),
            serde_json::to_string(&dump).unwrap(),
        )
        .unwrap();

        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[3]);
        k.observe_sector(3, &[1]);
        let mut state = GameState::default();
        state.sector = Some(1);

        let mut s = TwerkOptimized::new(TwerkConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            recalculate_interval: 25,
        });
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::TradeBuy);
    }

    #[tokio::test]
    async fn moves_toward_sell_leg_with_cargo() {
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2]);
        k.observe_sector(2, &[1, 3]);
        k.observe_sector(3, &[2]);
        let mut state = GameState::default();
        state.sector = Some(1);
        state.cargo.equipment = 15;

        let mut s = TwerkOptimized::with_pairs(TwerkConfig::default(), pairs());
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::Move);
        assert_eq!(d.move_target(), Some(2));
    }

    #[tokio::test]
    async fn no_dump_route_falls_back_to_drift() {
        let k = SectorKnowledge::default();
        let mut state = GameState::default();
        state.sector = Some(42);
        state.warps = vec![43];

        let mut s = TwerkOptimized::with_pairs(TwerkConfig::default(), Vec::new());
        let d = s.decide(&ctx(&state, &k)).await.unwrap();
        assert_eq!(d.action, ActionType::Move);
        assert_eq!(d.move_target(), Some(43));
    }
}
