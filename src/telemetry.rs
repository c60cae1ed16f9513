// =============================================================================
// Telemetry Store — per-bot counters, time series, and fleet rollups
// =============================================================================
//
// Workers push samples with every status report; the manager keeps a bounded
// time series per bot plus strategy-level aggregates.  Aggregates exclude
// implausible outliers: credits_per_turn samples are discarded when the bot
// has run fewer than 30 turns, completed no trades, or reports |cpt| > 100.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Rolling counters reported by one bot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BotCounters {
    pub trades_executed: u32,
    pub haggle_accept: u32,
    pub haggle_counter: u32,
    pub haggle_too_high: u32,
    pub haggle_too_low: u32,
    pub credits_delta: i64,
    pub credits_per_turn: f64,
    pub llm_wakeups: u32,
    /// Turn counts at which no trade had yet happened (t30/t60/t90/t120
    /// no-trade buckets).
    pub no_trade_t30: bool,
    pub no_trade_t60: bool,
    pub no_trade_t90: bool,
    pub no_trade_t120: bool,
}

/// One point in a bot's time series.
#[derive(Debug, Clone, Serialize)]
pub struct BotSample {
    /// Seconds since the store was created (monotonic).
    pub at_secs: u64,
    pub credits: i64,
    pub sector: Option<u32>,
    pub turns_executed: u32,
    pub counters: BotCounters,
    pub strategy_id: String,
}

/// Outlier filter bounds for strategy aggregates.
const CPT_MIN_TURNS: u32 = 30;
const CPT_MIN_TRADES: u32 = 1;
const CPT_MAX_ABS: f64 = 100.0;

/// Samples kept per bot.
const SERIES_CAP: usize = 720;

/// Fleet metrics store. One per manager process.
pub struct TelemetryStore {
    epoch: Instant,
    series: RwLock<HashMap<String, Vec<BotSample>>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            series: RwLock::new(HashMap::new()),
        }
    }

    fn now_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Record one status sample for a bot.
    pub fn record(
        &self,
        bot_id: &str,
        credits: i64,
        sector: Option<u32>,
        turns_executed: u32,
        counters: BotCounters,
        strategy_id: &str,
    ) {
        let sample = BotSample {
            at_secs: self.now_secs(),
            credits,
            sector,
            turns_executed,
            counters,
            strategy_id: strategy_id.to_string(),
        };
        let mut series = self.series.write();
        let entry = series.entry(bot_id.to_string()).or_default();
        entry.push(sample);
        if entry.len() > SERIES_CAP {
            let excess = entry.len() - SERIES_CAP;
            entry.drain(..excess);
        }
    }

    pub fn forget(&self, bot_id: &str) {
        self.series.write().remove(bot_id);
    }

    /// Latest sample per bot.
    pub fn latest(&self, bot_id: &str) -> Option<BotSample> {
        self.series.read().get(bot_id).and_then(|s| s.last().cloned())
    }

    /// Whether a sample passes the credits_per_turn outlier filter.
    fn cpt_sample_valid(sample: &BotSample) -> bool {
        sample.turns_executed >= CPT_MIN_TURNS
            && sample.counters.trades_executed >= CPT_MIN_TRADES
            && sample.counters.credits_per_turn.abs() <= CPT_MAX_ABS
    }

    /// Fleet rollup over the trailing window (default 15 minutes).
    pub fn fleet_summary(&self, window: Option<Duration>) -> serde_json::Value {
        let window = window.unwrap_or(Duration::from_secs(15 * 60));
        let cutoff = self.now_secs().saturating_sub(window.as_secs());
        let series = self.series.read();

        let mut bots_seen = 0u32;
        let mut total_credits_delta = 0i64;
        let mut total_trades = 0u32;
        let mut total_llm_wakeups = 0u32;
        // strategy -> (sum_cpt, samples)
        let mut strategy_cpt: HashMap<String, (f64, u32)> = HashMap::new();
        let mut strategy_excluded: HashMap<String, u32> = HashMap::new();

        for samples in series.values() {
            let windowed: Vec<&BotSample> =
                samples.iter().filter(|s| s.at_secs >= cutoff).collect();
            let Some(last) = windowed.last() else { continue };
            bots_seen += 1;
            total_credits_delta += last.counters.credits_delta;
            total_trades += last.counters.trades_executed;
            total_llm_wakeups += last.counters.llm_wakeups;

            if Self::cpt_sample_valid(last) {
                let entry = strategy_cpt.entry(last.strategy_id.clone()).or_default();
                entry.0 += last.counters.credits_per_turn;
                entry.1 += 1;
            } else {
                *strategy_excluded.entry(last.strategy_id.clone()).or_default() += 1;
            }
        }

        let strategies: serde_json::Map<String, serde_json::Value> = strategy_cpt
            .iter()
            .map(|(id, (sum, n))| {
                (
                    id.clone(),
                    json!({
                        "avg_credits_per_turn": sum / f64::from(*n),
                        "samples": n,
                        "excluded": strategy_excluded.get(id).copied().unwrap_or(0),
                    }),
                )
            })
            .collect();

        json!({
            "window_seconds": window.as_secs(),
            "bots": bots_seen,
            "total_credits_delta": total_credits_delta,
            "total_trades": total_trades,
            "total_llm_wakeups": total_llm_wakeups,
            "strategies": strategies,
        })
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn counters(trades: u32, cpt: f64) -> BotCounters {
        BotCounters {
            trades_executed: trades,
            credits_per_turn: cpt,
            credits_delta: 100,
            ..Default::default()
        }
    }

    #[test]
    fn records_and_returns_latest() {
        let store = TelemetryStore::new();
        store.record("b1", 1000, Some(5), 10, counters(1, 10.0), "profitable_pairs");
        store.record("b1", 2000, Some(6), 20, counters(2, 20.0), "profitable_pairs");
        let latest = store.latest("b1").unwrap();
        assert_eq!(latest.credits, 2000);
        assert_eq!(latest.turns_executed, 20);
    }

    #[test]
    fn cpt_outliers_excluded_from_strategy_aggregates() {
        let store = TelemetryStore::new();
        // Valid sample.
        store.record("b1", 5000, Some(5), 50, counters(3, 40.0), "profitable_pairs");
        // Too few turns.
        store.record("b2", 5000, Some(5), 10, counters(3, 40.0), "profitable_pairs");
        // No trades.
        store.record("b3", 5000, Some(5), 50, counters(0, 40.0), "profitable_pairs");
        // Implausible cpt.
        store.record("b4", 5000, Some(5), 50, counters(3, 400.0), "profitable_pairs");

        let summary = store.fleet_summary(None);
        let strat = &summary["strategies"]["profitable_pairs"];
        assert_eq!(strat["samples"], 1);
        assert_eq!(strat["excluded"], 3);
        assert!((strat["avg_credits_per_turn"].as_f64().unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn fleet_rollup_totals() {
        let store = TelemetryStore::new();
        store.record("b1", 1000, Some(1), 40, counters(2, 10.0), "opportunistic");
        store.record("b2", 2000, Some(2), 40, counters(4, 20.0), "opportunistic");

        let summary = store.fleet_summary(Some(Duration::from_secs(600)));
        assert_eq!(summary["bots"], 2);
        assert_eq!(summary["total_trades"], 6);
        assert_eq!(summary["total_credits_delta"], 200);
    }

    #[test]
    fn forget_drops_series() {
        let store = TelemetryStore::new();
        store.record("b1", 1000, None, 1, BotCounters::default(), "x");
        store.forget("b1");
        assert!(store.latest("b1").is_none());
    }

    #[test]
    fn series_is_bounded() {
        let store = TelemetryStore::new();
        for i in 0..(SERIES_CAP + 50) {
            store.record("b1", i as i64, None, i as u32, BotCounters::default(), "x");
        }
        assert_eq!(store.series.read().get("b1").unwrap().len(), SERIES_CAP);
    }
}
