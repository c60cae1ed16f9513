// =============================================================================
// Game State Tracker — authoritative per-bot game facts with freshness
// =============================================================================
//
// Consumes prompt detections and their KV data; falls back to raw screen-text
// parses when a detection carries no KV.  Every mutation is traceable to the
// snapshot it came from via (screen_hash, captured_at).
//
// Sector changes must be attributable to a move the bot actually sent; an
// unattributed change is reported as an anomaly for the intervention engine.
// =============================================================================

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detect::extract::KvValue;
use crate::detect::PromptDetection;
use crate::terminal::Snapshot;

// =============================================================================
// State model
// =============================================================================

/// Cargo holds by commodity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cargo {
    pub fuel_ore: i64,
    pub organics: i64,
    pub equipment: i64,
}

/// Current known game facts for one bot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameState {
    pub sector: Option<u32>,
    pub credits: Option<i64>,
    pub turns_remaining: Option<i64>,
    pub holds_free: Option<i64>,
    pub holds_total: Option<i64>,
    pub cargo: Cargo,
    /// Adjacent sectors from the latest sector display.
    pub warps: Vec<u32>,
    pub port_class: Option<String>,
    pub port_name: Option<String>,
    pub fighters: Option<i64>,
    pub shields: Option<i64>,
    pub ship_class: Option<String>,
    /// Monotonic ms of the last accepted update.
    pub last_update_ms: u64,
    /// Hash of the snapshot the last update came from.
    pub last_snapshot_hash: Option<String>,
}

/// A state mutation or observation worth surfacing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateEvent {
    SectorChanged {
        from: Option<u32>,
        to: u32,
        attributed: bool,
    },
    CreditsChanged {
        from: Option<i64>,
        to: i64,
    },
    /// Sector moved with no move action on record.
    Anomaly {
        description: String,
    },
}

// =============================================================================
// Fallback screen parsers
// =============================================================================

struct FallbackParsers {
    sector: Regex,
    credits: Regex,
    turns: Regex,
    holds: Regex,
    warps: Regex,
    port: Regex,
    fighters: Regex,
    shields: Regex,
}

fn parsers() -> &'static FallbackParsers {
    static PARSERS: OnceLock<FallbackParsers> = OnceLock::new();
    PARSERS.get_or_init(|| FallbackParsers {
        sector: Regex::new(r"Sector\s*:?\s*(\d+)").unwrap(),
        credits: Regex::new(r"Credits\s*:?\s*([\d,]+)").unwrap(),
        turns: Regex::new(r"Turns?\s+(?:left|remaining)\s*:?\s*([\d,]+)").unwrap(),
        holds: Regex::new(r"(\d+)\s+of\s+(\d+)\s+holds?").unwrap(),
        warps: Regex::new(r"Warps to Sector\(s\)\s*:?\s*([\d\s\-()]+)").unwrap(),
        port: Regex::new(r"Ports?\s*:\s*([^,\n]+),\s*Class\s*(\d+)").unwrap(),
        fighters: Regex::new(r"Fighters\s*:?\s*([\d,]+)").unwrap(),
        shields: Regex::new(r"Shields\s*:?\s*([\d,]+)").unwrap(),
    })
}

fn parse_i64(raw: &str) -> Option<i64> {
    raw.trim().replace(',', "").parse().ok()
}

// =============================================================================
// Tracker
// =============================================================================

/// Derives and maintains [`GameState`] from snapshots and detections.
pub struct GameStateTracker {
    state: GameState,
    /// Expected destination of a move the bot just sent, for attribution.
    pending_move: Option<Option<u32>>,
    /// Monotonic ms each field was last refreshed.
    freshness: HashMap<&'static str, u64>,
    /// Highest sector id accepted as plausible.
    max_sector: u32,
}

impl GameStateTracker {
    pub fn new(max_sector: u32) -> Self {
        Self {
            state: GameState::default(),
            pending_move: None,
            freshness: HashMap::new(),
            max_sector: max_sector.max(1),
        }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Record that the bot just sent a move.  `destination` may be unknown
    /// for blind warps; any subsequent sector change is then still
    /// attributed.
    pub fn note_move_sent(&mut self, destination: Option<u32>) {
        self.pending_move = Some(destination);
    }

    /// True when the last sent move has not yet shown a sector change.
    pub fn move_pending(&self) -> bool {
        self.pending_move.is_some()
    }

    /// Milliseconds since `field` was last refreshed, if ever.
    pub fn field_age_ms(&self, field: &str, now_ms: u64) -> Option<u64> {
        self.freshness
            .get(field)
            .map(|at| now_ms.saturating_sub(*at))
    }

    /// Apply one snapshot + optional detection.  `home_context` marks
    /// screens where a zero credit balance is a legitimate initial value.
    pub fn apply(
        &mut self,
        snapshot: &Snapshot,
        detection: Option<&PromptDetection>,
        home_context: bool,
    ) -> Vec<StateEvent> {
        let mut events = Vec::new();
        let now = snapshot.mono_ms;

        let kv = detection.and_then(|d| d.kv_data.as_ref());

        // ── Sector ──────────────────────────────────────────────────────
        let sector = kv
            .and_then(|kv| kv.get("sector"))
            .and_then(KvValue::as_i64)
            .map(|v| v as u32)
            .or_else(|| {
                parsers()
                    .sector
                    .captures(&snapshot.screen_text)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse().ok())
            });
        if let Some(sector) = sector {
            if sector >= 1 && sector <= self.max_sector {
                self.accept_sector(sector, now, &mut events);
            } else {
                warn!(sector, max = self.max_sector, "implausible sector ignored");
            }
        }

        // ── Credits ─────────────────────────────────────────────────────
        let kv_credits = kv.and_then(|kv| kv.get("credits")).and_then(KvValue::as_i64);
        let fallback_credits = parsers()
            .credits
            .captures(&snapshot.screen_text)
            .and_then(|c| c.get(1))
            .and_then(|m| parse_i64(m.as_str()));
        let credits = kv_credits.or(fallback_credits);
        if let Some(credits) = credits {
            // A zero read outside a home-planet context with known funds is
            // more likely a misparse than a real balance; hold the old value
            // until the next in-sector command screen confirms it.
            let suspicious_zero = credits == 0
                && !home_context
                && kv_credits.is_none()
                && self.state.credits.map(|c| c > 0).unwrap_or(false);
            if credits >= 0 && !suspicious_zero {
                if self.state.credits != Some(credits) {
                    events.push(StateEvent::CreditsChanged {
                        from: self.state.credits,
                        to: credits,
                    });
                }
                self.state.credits = Some(credits);
                self.freshness.insert("credits", now);
            }
        }

        // ── Remaining simple fields ─────────────────────────────────────
        if let Some(turns) = kv
            .and_then(|kv| kv.get("turns"))
            .and_then(KvValue::as_i64)
            .or_else(|| {
                parsers()
                    .turns
                    .captures(&snapshot.screen_text)
                    .and_then(|c| c.get(1))
                    .and_then(|m| parse_i64(m.as_str()))
            })
        {
            self.state.turns_remaining = Some(turns);
            self.freshness.insert("turns", now);
        }

        if let Some(c) = parsers().holds.captures(&snapshot.screen_text) {
            let used: Option<i64> = c.get(1).and_then(|m| parse_i64(m.as_str()));
            let total: Option<i64> = c.get(2).and_then(|m| parse_i64(m.as_str()));
            if let (Some(used), Some(total)) = (used, total) {
                self.state.holds_total = Some(total);
                self.state.holds_free = Some((total - used).max(0));
                self.freshness.insert("holds", now);
            }
        }
        for (key, slot) in [
            ("holds_free", 0usize),
            ("holds_total", 1),
            ("fuel_ore", 2),
            ("organics", 3),
            ("equipment", 4),
            ("fighters", 5),
            ("shields", 6),
        ] {
            if let Some(v) = kv.and_then(|kv| kv.get(key)).and_then(KvValue::as_i64) {
                match slot {
                    0 => self.state.holds_free = Some(v),
                    1 => self.state.holds_total = Some(v),
                    2 => self.state.cargo.fuel_ore = v,
                    3 => self.state.cargo.organics = v,
                    4 => self.state.cargo.equipment = v,
                    5 => self.state.fighters = Some(v),
                    6 => self.state.shields = Some(v),
                    _ => unreachable!(),
                }
                self.freshness.insert(key, now);
            }
        }
        if self.state.fighters.is_none() {
            if let Some(v) = parsers()
                .fighters
                .captures(&snapshot.screen_text)
                .and_then(|c| c.get(1))
                .and_then(|m| parse_i64(m.as_str()))
            {
                self.state.fighters = Some(v);
                self.freshness.insert("fighters", now);
            }
        }
        if self.state.shields.is_none() {
            if let Some(v) = parsers()
                .shields
                .captures(&snapshot.screen_text)
                .and_then(|c| c.get(1))
                .and_then(|m| parse_i64(m.as_str()))
            {
                self.state.shields = Some(v);
                self.freshness.insert("shields", now);
            }
        }

        // ── Warps ───────────────────────────────────────────────────────
        if let Some(c) = parsers().warps.captures(&snapshot.screen_text) {
            let list: Vec<u32> = c
                .get(1)
                .map(|m| {
                    m.as_str()
                        .split(|ch: char| !ch.is_ascii_digit())
                        .filter(|s| !s.is_empty())
                        .filter_map(|s| s.parse().ok())
                        .filter(|&s| s >= 1 && s <= self.max_sector)
                        .collect()
                })
                .unwrap_or_default();
            if !list.is_empty() {
                self.state.warps = list;
                self.freshness.insert("warps", now);
            }
        }

        // ── Port ────────────────────────────────────────────────────────
        let kv_port_name = kv
            .and_then(|kv| kv.get("port_name"))
            .and_then(|v| v.as_str().map(str::to_string));
        let kv_port_class = kv
            .and_then(|kv| kv.get("port_class"))
            .and_then(|v| v.as_str().map(str::to_string));
        if let (Some(name), Some(class)) = (kv_port_name.clone(), kv_port_class.clone()) {
            self.state.port_name = Some(name);
            self.state.port_class = Some(class);
            self.freshness.insert("port", now);
        } else if let Some(c) = parsers().port.captures(&snapshot.screen_text) {
            self.state.port_name = c.get(1).map(|m| m.as_str().trim().to_string());
            self.state.port_class = c.get(2).map(|m| m.as_str().to_string());
            self.freshness.insert("port", now);
        }

        if let Some(ship) = kv
            .and_then(|kv| kv.get("ship_class"))
            .and_then(|v| v.as_str().map(str::to_string))
        {
            self.state.ship_class = Some(ship);
            self.freshness.insert("ship_class", now);
        }

        if !events.is_empty() || detection.is_some() {
            self.state.last_update_ms = now;
            self.state.last_snapshot_hash = Some(snapshot.screen_hash.clone());
        }

        debug!(
            sector = ?self.state.sector,
            credits = ?self.state.credits,
            events = events.len(),
            "game state applied"
        );
        events
    }

    fn accept_sector(&mut self, sector: u32, now: u64, events: &mut Vec<StateEvent>) {
        let previous = self.state.sector;
        if previous == Some(sector) {
            self.freshness.insert("sector", now);
            // A pending move that lands in the same sector is not consumed:
            // the strategy layer treats this as a failed move.
            return;
        }

        let attributed = self.pending_move.is_some() || previous.is_none();
        if !attributed {
            events.push(StateEvent::Anomaly {
                description: format!(
                    "sector changed {previous:?} -> {sector} with no move on record"
                ),
            });
        }
        self.pending_move = None;

        events.push(StateEvent::SectorChanged {
            from: previous,
            to: sector,
            attributed,
        });
        self.state.sector = Some(sector);
        // Warps and port data belong to the previous sector.
        self.state.warps.clear();
        self.state.port_name = None;
        self.state.port_class = None;
        self.freshness.insert("sector", now);
    }
}
