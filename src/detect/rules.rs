// =============================================================================
// Prompt rule schema and loader
// =============================================================================
//
// A rules file is a namespaced, ORDERED list of prompt rules.  Order is
// semantically meaningful — more specific rules precede generic ones — so
// rules always live in a Vec, never a keyed map.  Rules whose regexes fail
// to compile are dropped with a diagnostic; a bad rule never crashes
// detection.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Schema types (the on-disk JSON shape)
// =============================================================================

/// What kind of input the BBS expects at this prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// One keystroke, no terminator.
    SingleKey,
    /// A line of input terminated by ENTER.
    MultiKey,
    /// Any keystroke clears the screen (pauses, splash pages).
    AnyKey,
}

impl Default for InputType {
    fn default() -> Self {
        Self::SingleKey
    }
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleKey => write!(f, "single_key"),
            Self::MultiKey => write!(f, "multi_key"),
            Self::AnyKey => write!(f, "any_key"),
        }
    }
}

/// Target type for one extracted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvType {
    String,
    Int,
    Float,
    Bool,
}

/// Validation constraints attached to one KV field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Regex the (string) value must fully match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
}

/// One field to capture from the screen when its rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvFieldSpec {
    pub field: String,
    #[serde(rename = "type")]
    pub kind: KvType,
    /// Capture group 1 is the raw value.
    pub regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<Constraints>,
    #[serde(default)]
    pub required: bool,
}

/// One prompt rule as written in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_match: Option<String>,
    #[serde(default)]
    pub input_type: InputType,
    /// Most prompts park the cursor after the prompt text; rules for
    /// mid-screen banners opt out.
    #[serde(default = "default_expect_cursor")]
    pub expect_cursor_at_end: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kv_extract: Vec<KvFieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_expect_cursor() -> bool {
    true
}

/// On-disk rules file: a namespace plus its ordered rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesFile {
    pub namespace: String,
    pub rules: Vec<RuleSpec>,
}

// =============================================================================
// Compiled form
// =============================================================================

/// A compiled KV field: spec + its compiled regexes.
#[derive(Debug, Clone)]
pub struct CompiledKvField {
    pub spec: KvFieldSpec,
    pub regex: Regex,
    pub constraint_pattern: Option<Regex>,
}

/// A rule with all regexes compiled, ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub pattern: Regex,
    pub negative_match: Option<Regex>,
    pub input_type: InputType,
    pub expect_cursor_at_end: bool,
    pub kv_fields: Vec<CompiledKvField>,
}

/// An ordered, namespaced set of compiled rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub namespace: String,
    pub rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Empty set — a session with no rules loaded detects nothing.
    pub fn empty(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            rules: Vec::new(),
        }
    }

    /// Compile a parsed rules file, preserving on-disk order. Uncompilable
    /// rules are dropped with a warning; uncompilable KV fields drop only
    /// that field.
    pub fn compile(file: RulesFile) -> Self {
        let mut rules = Vec::with_capacity(file.rules.len());

        for spec in file.rules {
            let pattern = match Regex::new(&spec.pattern) {
                Ok(re) => re,
                Err(e) => {
                    warn!(rule = %spec.id, error = %e, "rule pattern failed to compile; dropped");
                    continue;
                }
            };

            let negative_match = match &spec.negative_match {
                None => None,
                Some(neg) => match Regex::new(neg) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(rule = %spec.id, error = %e, "negative_match failed to compile; dropped");
                        continue;
                    }
                },
            };

            let mut kv_fields = Vec::with_capacity(spec.kv_extract.len());
            for field in &spec.kv_extract {
                let regex = match Regex::new(&field.regex) {
                    Ok(re) => re,
                    Err(e) => {
                        warn!(
                            rule = %spec.id,
                            field = %field.field,
                            error = %e,
                            "kv field regex failed to compile; field dropped"
                        );
                        continue;
                    }
                };
                let constraint_pattern = match field
                    .validate
                    .as_ref()
                    .and_then(|c| c.pattern.as_deref())
                {
                    None => None,
                    Some(p) => match Regex::new(p) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!(
                                rule = %spec.id,
                                field = %field.field,
                                error = %e,
                                "constraint pattern failed to compile; ignored"
                            );
                            None
                        }
                    },
                };
                kv_fields.push(CompiledKvField {
                    spec: field.clone(),
                    regex,
                    constraint_pattern,
                });
            }

            rules.push(CompiledRule {
                id: spec.id,
                pattern,
                negative_match,
                input_type: spec.input_type,
                expect_cursor_at_end: spec.expect_cursor_at_end,
                kv_fields,
            });
        }

        Self {
            namespace: file.namespace,
            rules,
        }
    }

    /// Load and compile a rules file from an explicit path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rules file {}", path.display()))?;
        let file: RulesFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse rules file {}", path.display()))?;

        let total = file.rules.len();
        let set = Self::compile(file);
        info!(
            namespace = %set.namespace,
            loaded = set.rules.len(),
            dropped = total - set.rules.len(),
            path = %path.display(),
            "prompt rules loaded"
        );
        Ok(set)
    }

    /// Conventional rules location under a persistence root:
    /// `<root>/games/<namespace>/rules.json`.
    pub fn default_path(root: &Path, namespace: &str) -> std::path::PathBuf {
        root.join("games").join(namespace).join("rules.json")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
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
                {
                    "id": "pause",
                    "pattern": "\\[Pause\\]",
                    "input_type": "any_key",
                    "expect_cursor_at_end": false
                },
                {
                    "id": "broken",
                    "pattern": "([unclosed",
                    "input_type": "single_key"
                }
            ]
        }"#
    }

    #[test]
    fn order_is_preserved_and_bad_rules_dropped() {
        let file: RulesFile = serde_json::from_str(sample_json()).unwrap();
        let set = RuleSet::compile(file);
        assert_eq!(set.namespace, "tw2002");
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].id, "sector_command");
        assert_eq!(set.rules[1].id, "pause");
    }

    #[test]
    fn defaults_applied() {
        let file: RulesFile = serde_json::from_str(sample_json()).unwrap();
        let set = RuleSet::compile(file);
        assert!(set.rules[0].expect_cursor_at_end);
        assert!(!set.rules[1].expect_cursor_at_end);
        assert_eq!(set.rules[1].input_type, InputType::AnyKey);
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, sample_json()).unwrap();
        let set = RuleSet::load(&path).unwrap();
        assert_eq!(set.rules.len(), 2);
    }

    #[test]
    fn default_path_layout() {
        let p = RuleSet::default_path(Path::new("/data"), "tw2002");
        assert_eq!(p, Path::new("/data/games/tw2002/rules.json"));
    }

    #[test]
    fn bad_kv_field_drops_only_the_field() {
        let json = r#"{
            "namespace": "t",
            "rules": [{
                "id": "r",
                "pattern": "ok",
                "kv_extract": [
                    { "field": "good", "type": "int", "regex": "(\\d+)" },
                    { "field": "bad", "type": "int", "regex": "([" }
                ]
            }]
        }"#;
        let set = RuleSet::compile(serde_json::from_str(json).unwrap());
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.rules[0].kv_fields.len(), 1);
        assert_eq!(set.rules[0].kv_fields[0].spec.field, "good");
    }
}
