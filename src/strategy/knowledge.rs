// =============================================================================
// Sector knowledge — the bot's accumulated map of the game universe
// =============================================================================
//
// Built up from sector displays and port dockings; persisted per character
// (and shared across characters when knowledge_sharing=shared).  Strategies
// query it for adjacency, trade data, and shortest paths.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// The three tradeable commodities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Commodity {
    FuelOre,
    Organics,
    Equipment,
}

impl std::fmt::Display for Commodity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FuelOre => write!(f, "fuel_ore"),
            Self::Organics => write!(f, "organics"),
            Self::Equipment => write!(f, "equipment"),
        }
    }
}

/// What is known about one port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortKnowledge {
    pub name: String,
    /// TW2002 port class digit as text ("1".."9", "0" for special).
    pub class: String,
    /// Commodities this port sells (bot buys here).
    #[serde(default)]
    pub selling: Vec<Commodity>,
    /// Commodities this port buys (bot sells here).
    #[serde(default)]
    pub buying: Vec<Commodity>,
    /// Best profit observed trading through this port.
    #[serde(default)]
    pub best_profit: i64,
    /// Number of completed trades at this port.
    #[serde(default)]
    pub trades: u32,
}

impl PortKnowledge {
    /// Special-class ports never trade; docking there is invalid.
    pub fn is_special(&self) -> bool {
        matches!(self.class.as_str(), "0" | "9")
    }

    /// Port has observed trade data at all.
    pub fn has_trade_data(&self) -> bool {
        !self.selling.is_empty() || !self.buying.is_empty() || self.trades > 0
    }
}

/// Per-character map knowledge, serialized into `<character>_state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectorKnowledge {
    #[serde(default)]
    pub visited: HashSet<u32>,
    /// Adjacency as observed from sector displays.
    #[serde(default)]
    pub warps: HashMap<u32, Vec<u32>>,
    #[serde(default)]
    pub ports: HashMap<u32, PortKnowledge>,
    /// Sectors with hostile fighters or mines.
    #[serde(default)]
    pub danger_zones: HashSet<u32>,
    /// Sectors probed by long-range scan.
    #[serde(default)]
    pub scanned: HashSet<u32>,
}

impl SectorKnowledge {
    /// Record a visit and the observed outbound warps.
    pub fn observe_sector(&mut self, sector: u32, warps: &[u32]) {
        self.visited.insert(sector);
        if !warps.is_empty() {
            self.warps.insert(sector, warps.to_vec());
        }
    }

    pub fn observe_port(&mut self, sector: u32, port: PortKnowledge) {
        self.ports.insert(sector, port);
    }

    pub fn record_trade(&mut self, sector: u32, profit: i64) {
        let port = self.ports.entry(sector).or_default();
        port.trades += 1;
        if profit > port.best_profit {
            port.best_profit = profit;
        }
    }

    pub fn neighbors(&self, sector: u32) -> &[u32] {
        self.warps.get(&sector).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Neighbors never visited, in adjacency order.
    pub fn unvisited_neighbors(&self, sector: u32) -> Vec<u32> {
        self.neighbors(sector)
            .iter()
            .copied()
            .filter(|s| !self.visited.contains(s))
            .collect()
    }

    /// Breadth-first shortest path over known warps, avoiding danger zones.
    /// Returns the hop sequence excluding `from`, or None when unreachable.
    pub fn path(&self, from: u32, to: u32) -> Option<Vec<u32>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut prev: HashMap<u32, u32> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::from([from]);

        while let Some(current) = queue.pop_front() {
            for &next in self.neighbors(current) {
                if seen.contains(&next) || self.danger_zones.contains(&next) {
                    continue;
                }
                seen.insert(next);
                prev.insert(next, current);
                if next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(&p) = prev.get(&cursor) {
                        if p == from {
                            break;
                        }
                        path.push(p);
                        cursor = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Hop distance between two sectors over known warps.
    pub fn distance(&self, from: u32, to: u32) -> Option<u32> {
        self.path(from, to).map(|p| p.len() as u32)
    }

    /// Ports with trade data within `max_hops` of `from`, with distances.
    pub fn trading_ports_within(&self, from: u32, max_hops: u32) -> Vec<(u32, u32)> {
        self.ports
            .iter()
            .filter(|(_, p)| p.has_trade_data() && !p.is_special())
            .filter_map(|(&sector, _)| {
                self.distance(from, sector)
                    .filter(|&d| d <= max_hops)
                    .map(|d| (sector, d))
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn linear_map() -> SectorKnowledge {
        // 1 - 2 - 3 - 4, with a branch 2 - 5
        let mut k = SectorKnowledge::default();
        k.observe_sector(1, &[2]);
        k.observe_sector(2, &[1, 3, 5]);
        k.observe_sector(3, &[2, 4]);
        k.observe_sector(4, &[3]);
        k.observe_sector(5, &[2]);
        k
    }

    #[test]
    fn bfs_finds_shortest_path() {
        let k = linear_map();
        assert_eq!(k.path(1, 4).unwrap(), vec![2, 3, 4]);
        assert_eq!(k.distance(1, 4), Some(3));
        assert_eq!(k.path(3, 3).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn danger_zones_are_avoided() {
        let mut k = linear_map();
        k.danger_zones.insert(3);
        assert!(k.path(1, 4).is_none());
    }

    #[test]
    fn unvisited_neighbors_filtered() {
        let mut k = linear_map();
        k.visited.remove(&5);
        k.visited.remove(&3);
        assert_eq!(k.unvisited_neighbors(2), vec![3, 5]);
    }

    #[test]
    fn special_ports_excluded_from_trading() {
        let mut k = linear_map();
        k.observe_port(
            3,
            PortKnowledge {
                name: "Stardock".into(),
                class: "9".into(),
                trades: 10,
                ..Default::default()
            },
        );
        k.observe_port(
            4,
            PortKnowledge {
                name: "Vega".into(),
                class: "3".into(),
                selling: vec![Commodity::FuelOre],
                buying: vec![Commodity::Equipment],
                ..Default::default()
            },
        );
        let ports = k.trading_ports_within(1, 5);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].0, 4);
    }

    #[test]
    fn serde_round_trip() {
        let mut k = linear_map();
        k.danger_zones.insert(9);
        k.record_trade(2, 450);
        let json = serde_json::to_string(&k).unwrap();
        let back: SectorKnowledge = serde_json::from_str(&json).unwrap();
        assert_eq!(back.visited, k.visited);
        assert_eq!(back.ports.get(&2).unwrap().best_profit, 450);
    }
}
