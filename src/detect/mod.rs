// =============================================================================
// Prompt Detector — ordered rule pipeline over screen snapshots
// =============================================================================
//
// Evaluates the loaded rule sequence, in order, against each snapshot:
// pattern must match, negative_match must not, and (when required) the
// cursor must sit at the end of the screen text.  The first rule that
// survives all three gates wins.  Rules that matched the pattern but fell
// to a later gate are remembered as partial matches for tracing and for
// the manager's screen analysis surface.
//
// Idempotence: the caller passes the hash of the last screen it acted on;
// a snapshot with the same hash is skipped entirely so a silent BBS never
// triggers duplicate actions.
// =============================================================================

pub mod extract;
pub mod rules;

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::terminal::Snapshot;
use extract::KvData;
use rules::{InputType, RuleSet};

// =============================================================================
// Detection results
// =============================================================================

/// A successful prompt identification.
#[derive(Debug, Clone, Serialize)]
pub struct PromptDetection {
    pub prompt_id: String,
    pub input_type: InputType,
    /// Screen has been stable for at least the idle threshold.
    pub is_idle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_data: Option<KvData>,
    /// The substring matched by the rule pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
    /// Hash of the screen this detection was made on.
    pub screen_hash: String,
}

impl PromptDetection {
    /// Flattened JSON used in `prompt_detected` log events.
    pub fn to_log_value(&self) -> serde_json::Value {
        json!({
            "prompt_id": self.prompt_id,
            "input_type": self.input_type.to_string(),
            "is_idle": self.is_idle,
            "kv_data": self.kv_data,
        })
    }
}

/// Why a rule that matched its pattern was not selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    NegativeMatch,
    CursorCheckFailed,
}

/// A rule whose pattern matched but which a later gate rejected.
#[derive(Debug, Clone, Serialize)]
pub struct PartialMatch {
    pub rule_id: String,
    pub reason: PartialReason,
}

/// Full evaluation result: the winning detection (if any) plus diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DetectOutcome {
    pub detection: Option<PromptDetection>,
    /// Every rule whose pattern matched, in rule order.
    pub matched_rule_ids: Vec<String>,
    pub partial_matches: Vec<PartialMatch>,
    /// True when evaluation was skipped because the hash was already
    /// processed.
    pub skipped_same_hash: bool,
}

// =============================================================================
// Detector
// =============================================================================

/// Default time a screen must hold still before a prompt counts as idle.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(2);

/// Stateful prompt detector for one session.
#[derive(Debug)]
pub struct PromptDetector {
    rules: RuleSet,
    idle_threshold: Duration,
    /// Hash of the most recently observed screen and when it last changed,
    /// for idle computation.
    last_seen: Mutex<Option<(String, Instant)>>,
}

impl PromptDetector {
    pub fn new(rules: RuleSet, idle_threshold: Duration) -> Self {
        Self {
            rules,
            idle_threshold,
            last_seen: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.rules.namespace
    }

    pub fn rule_count(&self) -> usize {
        self.rules.rules.len()
    }

    /// Track screen change time and report whether the screen is idle.
    fn observe_idle(&self, screen_hash: &str) -> bool {
        let mut guard = self.last_seen.lock();
        match guard.as_mut() {
            Some((hash, changed_at)) if hash == screen_hash => {
                changed_at.elapsed() >= self.idle_threshold
            }
            _ => {
                *guard = Some((screen_hash.to_string(), Instant::now()));
                false
            }
        }
    }

    /// Evaluate the rule pipeline against a snapshot.
    ///
    /// `last_processed_hash` is the session's idempotence guard: when it
    /// equals the snapshot hash the whole evaluation is skipped.
    pub fn detect(
        &self,
        snapshot: &Snapshot,
        last_processed_hash: Option<&str>,
    ) -> DetectOutcome {
        if last_processed_hash == Some(snapshot.screen_hash.as_str()) {
            // Still refresh idle tracking so a later prompt reads as idle.
            self.observe_idle(&snapshot.screen_hash);
            return DetectOutcome {
                detection: None,
                matched_rule_ids: Vec::new(),
                partial_matches: Vec::new(),
                skipped_same_hash: true,
            };
        }

        let is_idle = self.observe_idle(&snapshot.screen_hash);
        self.evaluate(snapshot, is_idle, true)
    }

    /// Evaluate without the idempotence guard and without stopping at the
    /// first hit — the manager's screen-analysis surface wants every match
    /// and every partial.
    pub fn analyze(&self, snapshot: &Snapshot) -> DetectOutcome {
        let is_idle = self.observe_idle(&snapshot.screen_hash);
        self.evaluate(snapshot, is_idle, false)
    }

    fn evaluate(&self, snapshot: &Snapshot, is_idle: bool, first_only: bool) -> DetectOutcome {
        let mut matched_rule_ids = Vec::new();
        let mut partial_matches = Vec::new();
        let mut detection: Option<PromptDetection> = None;

        for rule in &self.rules.rules {
            let Some(m) = rule.pattern.find(&snapshot.screen_text) else {
                continue;
            };
            matched_rule_ids.push(rule.id.clone());

            if let Some(neg) = &rule.negative_match {
                if neg.is_match(&snapshot.screen_text) {
                    partial_matches.push(PartialMatch {
                        rule_id: rule.id.clone(),
                        reason: PartialReason::NegativeMatch,
                    });
                    continue;
                }
            }

            if rule.expect_cursor_at_end && !snapshot.cursor_at_end {
                partial_matches.push(PartialMatch {
                    rule_id: rule.id.clone(),
                    reason: PartialReason::CursorCheckFailed,
                });
                continue;
            }

            if detection.is_none() {
                let kv_data = if rule.kv_fields.is_empty() {
                    None
                } else {
                    Some(extract::extract(&rule.kv_fields, &snapshot.screen_text))
                };

                detection = Some(PromptDetection {
                    prompt_id: rule.id.clone(),
                    input_type: rule.input_type,
                    is_idle,
                    kv_data,
                    matched: Some(m.as_str().to_string()),
                    screen_hash: snapshot.screen_hash.clone(),
                });

                if first_only {
                    break;
                }
            }
        }

        DetectOutcome {
            detection,
            matched_rule_ids,
            partial_matches,
            skipped_same_hash: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{Cursor, Screen};
    use rules::RulesFile;
    use sha2::Digest;

    fn snapshot(text: &str, cursor_at_end: bool) -> Snapshot {
        let hash = hex::encode(sha2::Sha256::digest(text.as_bytes()));
        Snapshot::from_screen(
            Screen {
                text: text.to_string(),
                hash,
                cursor: Cursor { col: 0, row: 0 },
                cursor_at_end,
                has_trailing_space: false,
            },
            Vec::new(),
            chrono::Utc::now().to_rfc3339(),
            0,
        )
    }

    fn detector(json: &str) -> PromptDetector {
        let file: RulesFile = serde_json::from_str(json).unwrap();
        PromptDetector::new(RuleSet::compile(file), Duration::from_millis(0))
    }

    fn tw_rules() -> PromptDetector {
        detector(
            r#"{
                "namespace": "tw2002",
                "rules": [
                    {
                        "id": "sector_command",
                        "pattern": "Command \\[TL=",
                        "input_type": "single_key",
                        "kv_extract": [
                            { "field": "sector", "type": "int", "regex": ":\\[(\\d+)\\]", "required": true }
                        ]
                    },
                    { "id": "pause", "pattern": "\\[Pause\\]", "input_type": "any_key", "expect_cursor_at_end": false }
                ]
            }"#,
        )
    }

    #[test]
    fn first_matching_rule_wins_in_order() {
        let d = tw_rules();
        let snap = snapshot("Command [TL=00:00:00]:[499] (?=Help)? :", true);
        let out = d.detect(&snap, None);
        let det = out.detection.unwrap();
        assert_eq!(det.prompt_id, "sector_command");
        assert_eq!(det.input_type, InputType::SingleKey);
        // With a zero idle threshold the prompt reads as idle on the second
        // observation of the same hash.
        let out2 = d.analyze(&snap);
        assert!(out2.detection.unwrap().is_idle);
    }

    #[test]
    fn kv_data_attached_when_configured() {
        let d = tw_rules();
        let snap = snapshot("Command [TL=00:00:00]:[499] (?=Help)? :", true);
        let det = d.detect(&snap, None).detection.unwrap();
        let kv = det.kv_data.unwrap();
        assert_eq!(kv.get("sector").unwrap().as_i64(), Some(499));
        assert!(kv.validation.valid);
    }

    #[test]
    fn cursor_check_produces_partial_match() {
        let d = detector(
            r#"{
                "namespace": "t",
                "rules": [
                    { "id": "login_name", "pattern": "enter your name", "input_type": "multi_key" }
                ]
            }"#,
        );
        let text = "Please enter your name (ENTER for none):";

        let hit = d.detect(&snapshot(text, true), None);
        assert_eq!(hit.detection.unwrap().prompt_id, "login_name");

        let miss = d.detect(&snapshot(text, false), None);
        assert!(miss.detection.is_none());
        assert_eq!(miss.partial_matches.len(), 1);
        assert_eq!(miss.partial_matches[0].reason, PartialReason::CursorCheckFailed);
    }

    #[test]
    fn negative_match_rejects() {
        let d = detector(
            r#"{
                "namespace": "t",
                "rules": [
                    { "id": "menu", "pattern": "Selection", "negative_match": "Game Over", "input_type": "single_key" }
                ]
            }"#,
        );
        let out = d.detect(&snapshot("Selection: Game Over", true), None);
        assert!(out.detection.is_none());
        assert_eq!(out.partial_matches[0].reason, PartialReason::NegativeMatch);
    }

    #[test]
    fn idempotence_guard_skips_processed_hash() {
        let d = tw_rules();
        let snap = snapshot("Command [TL=00:00:00]:[499] :", true);
        let first = d.detect(&snap, None);
        let hash = first.detection.as_ref().unwrap().screen_hash.clone();

        let second = d.detect(&snap, Some(&hash));
        assert!(second.detection.is_none());
        assert!(second.skipped_same_hash);
    }

    #[test]
    fn analyze_reports_all_matches() {
        let d = detector(
            r#"{
                "namespace": "t",
                "rules": [
                    { "id": "a", "pattern": "shared text" },
                    { "id": "b", "pattern": "shared" }
                ]
            }"#,
        );
        let out = d.analyze(&snapshot("shared text here", true));
        assert_eq!(out.matched_rule_ids, vec!["a", "b"]);
        assert_eq!(out.detection.unwrap().prompt_id, "a");
    }
}
