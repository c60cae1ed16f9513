// =============================================================================
// Goal Phase Tracker — spans of turns optimizing for one objective
// =============================================================================
//
// Goal history is an append-only sequence of phases.  Changing goal closes
// the active phase with final metrics; a rewind freezes the active phase and
// opens a replacement starting at an earlier turn.  The full timeline can be
// reconstructed from a session JSONL by replaying goal.changed/goal.rewound
// events.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

// =============================================================================
// Types
// =============================================================================

/// The objective a phase optimizes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalId {
    Profit,
    Combat,
    Exploration,
    Banking,
}

impl Default for GoalId {
    fn default() -> Self {
        Self::Profit
    }
}

impl std::fmt::Display for GoalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Profit => write!(f, "profit"),
            Self::Combat => write!(f, "combat"),
            Self::Exploration => write!(f, "exploration"),
            Self::Banking => write!(f, "banking"),
        }
    }
}

impl std::str::FromStr for GoalId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "profit" => Ok(Self::Profit),
            "combat" => Ok(Self::Combat),
            "exploration" | "explore" => Ok(Self::Exploration),
            "banking" | "bank" => Ok(Self::Banking),
            other => Err(format!("unknown goal '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Active,
    Completed,
    Failed,
    Rewound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Auto,
    Manual,
    Rewind,
}

/// Start/end metrics for one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub start_credits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_credits: Option<i64>,
    pub turns: u32,
}

/// One span of turns optimizing for a single goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalPhase {
    pub goal_id: GoalId,
    pub start_turn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_turn: Option<u32>,
    pub status: PhaseStatus,
    pub trigger_type: TriggerType,
    pub metrics: PhaseMetrics,
    pub reason: String,
}

impl GoalPhase {
    /// True when the phase improved on the metric it optimizes (credits for
    /// profit/banking; any non-regression otherwise).
    fn moved_favorably(&self, end_credits: i64) -> bool {
        end_credits >= self.metrics.start_credits
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Owns the ordered phase history for one bot.
#[derive(Debug, Default)]
pub struct GoalPhaseTracker {
    phases: Vec<GoalPhase>,
}

impl GoalPhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the first phase. A no-op when a phase already exists.
    pub fn start(&mut self, goal_id: GoalId, turn: u32, credits: i64, reason: &str) {
        if self.phases.is_empty() {
            self.phases.push(GoalPhase {
                goal_id,
                start_turn: turn,
                end_turn: None,
                status: PhaseStatus::Active,
                trigger_type: TriggerType::Auto,
                metrics: PhaseMetrics {
                    start_credits: credits,
                    end_credits: None,
                    turns: 0,
                },
                reason: reason.to_string(),
            });
        }
    }

    /// Close the active phase and open a new one.  Returns the log payload
    /// for a `goal.changed` event.
    pub fn set_goal(
        &mut self,
        goal_id: GoalId,
        trigger_type: TriggerType,
        reason: &str,
        turn: u32,
        credits: i64,
    ) -> Value {
        if let Some(active) = self.phases.iter_mut().rev().find(|p| p.status == PhaseStatus::Active)
        {
            active.end_turn = Some(turn);
            active.metrics.end_credits = Some(credits);
            active.metrics.turns = turn.saturating_sub(active.start_turn);
            active.status = if active.moved_favorably(credits) {
                PhaseStatus::Completed
            } else {
                PhaseStatus::Failed
            };
        }

        let previous = self.phases.last().map(|p| p.goal_id);
        self.phases.push(GoalPhase {
            goal_id,
            start_turn: turn,
            end_turn: None,
            status: PhaseStatus::Active,
            trigger_type,
            metrics: PhaseMetrics {
                start_credits: credits,
                end_credits: None,
                turns: 0,
            },
            reason: reason.to_string(),
        });

        info!(goal = %goal_id, turn, reason, "goal changed");
        json!({
            "goal_id": goal_id.to_string(),
            "previous": previous.map(|g| g.to_string()),
            "turn": turn,
            "credits": credits,
            "trigger_type": trigger_type,
            "reason": reason,
        })
    }

    /// Mark the active phase rewound and open a replacement starting at
    /// `turn`.  Metrics of the rewound phase are frozen as they stand.
    /// Returns the `goal.rewound` log payload.
    pub fn rewind_to_turn(&mut self, turn: u32, reason: &str, credits: i64) -> Value {
        let goal_id = self
            .phases
            .iter()
            .rev()
            .find(|p| p.status == PhaseStatus::Active)
            .map(|p| p.goal_id)
            .unwrap_or_default();

        if let Some(active) = self.phases.iter_mut().rev().find(|p| p.status == PhaseStatus::Active)
        {
            active.status = PhaseStatus::Rewound;
        }

        self.phases.push(GoalPhase {
            goal_id,
            start_turn: turn,
            end_turn: None,
            status: PhaseStatus::Active,
            trigger_type: TriggerType::Rewind,
            metrics: PhaseMetrics {
                start_credits: credits,
                end_credits: None,
                turns: 0,
            },
            reason: reason.to_string(),
        });

        info!(goal = %goal_id, turn, reason, "goal phase rewound");
        json!({
            "goal_id": goal_id.to_string(),
            "turn": turn,
            "credits": credits,
            "reason": reason,
        })
    }

    pub fn current(&self) -> Option<&GoalPhase> {
        self.phases.iter().rev().find(|p| p.status == PhaseStatus::Active)
    }

    pub fn history(&self) -> &[GoalPhase] {
        &self.phases
    }

    /// Rebuild a tracker from session JSONL records by replaying
    /// `goal.changed` and `goal.rewound` events in order.
    pub fn replay(records: &[Value]) -> Self {
        let mut tracker = Self::new();
        for record in records {
            let turn = record["turn"].as_u64().unwrap_or(0) as u32;
            let credits = record["credits"].as_i64().unwrap_or(0);
            let reason = record["reason"].as_str().unwrap_or("");
            match record["event"].as_str() {
                Some("goal.changed") => {
                    let goal: GoalId = record["goal_id"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default();
                    let trigger = match record["trigger_type"].as_str() {
                        Some("manual") => TriggerType::Manual,
                        _ => TriggerType::Auto,
                    };
                    if tracker.phases.is_empty() {
                        tracker.start(goal, turn, credits, reason);
                    } else {
                        tracker.set_goal(goal, trigger, reason, turn, credits);
                    }
                }
                Some("goal.rewound") => {
                    tracker.rewind_to_turn(turn, reason, credits);
                }
                _ => {}
            }
        }
        tracker
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_goal_closes_previous_with_verdict() {
        let mut t = GoalPhaseTracker::new();
        t.start(GoalId::Profit, 0, 1000, "session start");

        // Credits rose: the closed phase is Completed.
        t.set_goal(GoalId::Exploration, TriggerType::Auto, "stagnation", 20, 5000);
        assert_eq!(t.history()[0].status, PhaseStatus::Completed);
        assert_eq!(t.history()[0].end_turn, Some(20));
        assert_eq!(t.history()[0].metrics.end_credits, Some(5000));
        assert_eq!(t.history()[0].metrics.turns, 20);

        // Credits fell: the next close is Failed.
        t.set_goal(GoalId::Banking, TriggerType::Manual, "operator", 30, 100);
        assert_eq!(t.history()[1].status, PhaseStatus::Failed);

        let current = t.current().unwrap();
        assert_eq!(current.goal_id, GoalId::Banking);
        assert_eq!(current.trigger_type, TriggerType::Manual);
    }

    #[test]
    fn rewind_freezes_metrics_and_opens_replacement() {
        let mut t = GoalPhaseTracker::new();
        t.start(GoalId::Profit, 0, 1000, "start");
        t.rewind_to_turn(5, "bad trades undone", 900);

        assert_eq!(t.history().len(), 2);
        assert_eq!(t.history()[0].status, PhaseStatus::Rewound);
        // Frozen: the rewound phase keeps no end metrics.
        assert!(t.history()[0].metrics.end_credits.is_none());

        let current = t.current().unwrap();
        assert_eq!(current.start_turn, 5);
        assert_eq!(current.trigger_type, TriggerType::Rewind);
        assert_eq!(current.goal_id, GoalId::Profit);
    }

    #[test]
    fn replay_reconstructs_timeline() {
        let mut t = GoalPhaseTracker::new();
        t.start(GoalId::Profit, 0, 0, "start");
        let ev1 = {
            let mut v = t.set_goal(GoalId::Exploration, TriggerType::Auto, "loop detected", 12, 800);
            v["event"] = serde_json::json!("goal.changed");
            v
        };
        let ev2 = {
            let mut v = t.rewind_to_turn(8, "rollback", 700);
            v["event"] = serde_json::json!("goal.rewound");
            v
        };

        let replayed = GoalPhaseTracker::replay(&[
            serde_json::json!({
                "event": "goal.changed", "goal_id": "profit", "turn": 0,
                "credits": 0, "trigger_type": "auto", "reason": "start"
            }),
            ev1,
            ev2,
        ]);

        assert_eq!(replayed.history().len(), t.history().len());
        assert_eq!(replayed.current().unwrap().goal_id, GoalId::Exploration);
        assert_eq!(replayed.current().unwrap().start_turn, 8);
    }

    #[test]
    fn goal_id_parsing() {
        assert_eq!("profit".parse::<GoalId>().unwrap(), GoalId::Profit);
        assert_eq!("EXPLORE".parse::<GoalId>().unwrap(), GoalId::Exploration);
        assert!("speedrun".parse::<GoalId>().is_err());
    }
}
