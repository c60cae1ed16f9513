// =============================================================================
// Bot Configuration — declarative settings with atomic save
// =============================================================================
//
// Every tunable for a single bot and for the swarm manager lives here.
// All fields carry `#[serde(default)]` so adding new fields never breaks
// loading an older config file.  Persistence uses the tmp + rename pattern
// to prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    23
}

fn default_term_name() -> String {
    "ansi".to_string()
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    25
}

fn default_game_letter() -> String {
    "A".to_string()
}

fn default_name_complexity() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "tw2002".to_string()
}

fn default_persist_root() -> String {
    "data".to_string()
}

fn default_max_hop_distance() -> u32 {
    5
}

fn default_min_profit_per_turn() -> i64 {
    50
}

fn default_explore_chance() -> f64 {
    0.3
}

fn default_max_wander() -> u32 {
    8
}

fn default_recalculate_interval() -> u32 {
    25
}

fn default_fallback_strategy() -> String {
    "profitable_pairs".to_string()
}

fn default_fallback_threshold() -> u32 {
    3
}

fn default_fallback_duration() -> u32 {
    10
}

fn default_context_mode() -> String {
    "summary".to_string()
}

fn default_llm_timeout_ms() -> u64 {
    30_000
}

fn default_feedback_interval() -> u32 {
    10
}

fn default_feedback_lookback() -> u32 {
    20
}

fn default_feedback_max_tokens() -> u32 {
    512
}

fn default_history_window() -> u32 {
    10
}

fn default_loop_action_threshold() -> u32 {
    3
}

fn default_loop_sector_threshold() -> u32 {
    4
}

fn default_stagnation_turns() -> u32 {
    15
}

fn default_profit_decline_ratio() -> f64 {
    0.5
}

fn default_turn_waste_threshold() -> f64 {
    0.3
}

fn default_high_value_trade_min() -> i64 {
    5000
}

fn default_combat_ready_fighters() -> i64 {
    50
}

fn default_combat_ready_shields() -> i64 {
    100
}

fn default_banking_threshold() -> i64 {
    100_000
}

fn default_min_priority() -> String {
    "medium".to_string()
}

fn default_cooldown_turns() -> u32 {
    5
}

fn default_max_per_session() -> u32 {
    20
}

fn default_analysis_temperature() -> f64 {
    0.2
}

fn default_analysis_max_tokens() -> u32 {
    768
}

fn default_max_characters() -> u32 {
    1
}

fn default_knowledge_sharing() -> String {
    "independent".to_string()
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    30
}

fn default_llm_retries() -> u32 {
    2
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_turns() -> u32 {
    200
}

fn default_manager_port() -> u16 {
    8700
}

fn default_manager_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_bots() -> u32 {
    25
}

fn default_state_file() -> String {
    "data/swarm_state.json".to_string()
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_status_broadcast_interval() -> u64 {
    5
}

fn default_bot_timeout() -> u64 {
    60
}

fn default_hijack_heartbeat_timeout() -> u64 {
    30
}

fn default_max_sessions() -> u32 {
    8
}

// =============================================================================
// Option groups
// =============================================================================

/// Where and how to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_term_name")]
    pub term_name: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// TWGS game selection letter.
    #[serde(default = "default_game_letter")]
    pub game_letter: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            term_name: default_term_name(),
            cols: default_cols(),
            rows: default_rows(),
            game_letter: default_game_letter(),
        }
    }
}

/// Generated character identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterConfig {
    /// 1 = single word, 2 = adjective+noun, 3 = adds a flourish.
    #[serde(default = "default_name_complexity")]
    pub name_complexity: u8,
    #[serde(default = "default_true")]
    pub generate_ship_names: bool,
    #[serde(default)]
    pub ship_names_with_numbers: bool,
    /// Fixed seed for reproducible identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            name_complexity: default_name_complexity(),
            generate_ship_names: true,
            ship_names_with_numbers: false,
            name_seed: None,
            password: None,
        }
    }
}

/// Which strategy drives the bot and its per-strategy tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ProfitablePairs,
    Opportunistic,
    TwerkOptimized,
    AiStrategy,
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::ProfitablePairs
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProfitablePairs => write!(f, "profitable_pairs"),
            Self::Opportunistic => write!(f, "opportunistic"),
            Self::TwerkOptimized => write!(f, "twerk_optimized"),
            Self::AiStrategy => write!(f, "ai_strategy"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitablePairsConfig {
    #[serde(default = "default_max_hop_distance")]
    pub max_hop_distance: u32,
    #[serde(default = "default_min_profit_per_turn")]
    pub min_profit_per_turn: i64,
}

impl Default for ProfitablePairsConfig {
    fn default() -> Self {
        Self {
            max_hop_distance: default_max_hop_distance(),
            min_profit_per_turn: default_min_profit_per_turn(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunisticConfig {
    /// Probability of exploring an unvisited neighbor instead of trading.
    #[serde(default = "default_explore_chance")]
    pub explore_chance: f64,
    /// Forced trade after this many consecutive explore steps.
    #[serde(default = "default_max_wander")]
    pub max_wander_without_trade: u32,
}

impl Default for OpportunisticConfig {
    fn default() -> Self {
        Self {
            explore_chance: default_explore_chance(),
            max_wander_without_trade: default_max_wander(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwerkConfig {
    /// Directory holding the precomputed trade-pair dump.
    #[serde(default)]
    pub data_dir: String,
    /// Routes are recomputed every N turns.
    #[serde(default = "default_recalculate_interval")]
    pub recalculate_interval: u32,
}

impl Default for TwerkConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            recalculate_interval: default_recalculate_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiStrategyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fallback_strategy")]
    pub fallback_strategy: String,
    /// Consecutive LLM failures before switching to the fallback.
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: u32,
    /// Turns spent on the fallback before retrying the LLM.
    #[serde(default = "default_fallback_duration")]
    pub fallback_duration_turns: u32,
    /// "summary" or "full" game-state context in prompts.
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub feedback_enabled: bool,
    #[serde(default = "default_feedback_interval")]
    pub feedback_interval_turns: u32,
    #[serde(default = "default_feedback_lookback")]
    pub feedback_lookback_turns: u32,
    #[serde(default = "default_feedback_max_tokens")]
    pub feedback_max_tokens: u32,
    /// Recent decisions included in each prompt.
    #[serde(default = "default_history_window")]
    pub history_window: u32,
}

impl Default for AiStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fallback_strategy: default_fallback_strategy(),
            fallback_threshold: default_fallback_threshold(),
            fallback_duration_turns: default_fallback_duration(),
            context_mode: default_context_mode(),
            timeout_ms: default_llm_timeout_ms(),
            feedback_enabled: false,
            feedback_interval_turns: default_feedback_interval(),
            feedback_lookback_turns: default_feedback_lookback(),
            feedback_max_tokens: default_feedback_max_tokens(),
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub profitable_pairs: ProfitablePairsConfig,
    #[serde(default)]
    pub opportunistic: OpportunisticConfig,
    #[serde(default)]
    pub twerk_optimized: TwerkConfig,
    #[serde(default)]
    pub ai_strategy: AiStrategyConfig,
}

/// Anomaly/opportunity observer thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_action_threshold")]
    pub loop_action_threshold: u32,
    #[serde(default = "default_loop_sector_threshold")]
    pub loop_sector_threshold: u32,
    #[serde(default = "default_stagnation_turns")]
    pub stagnation_turns: u32,
    #[serde(default = "default_profit_decline_ratio")]
    pub profit_decline_ratio: f64,
    #[serde(default = "default_turn_waste_threshold")]
    pub turn_waste_threshold: f64,
    #[serde(default = "default_high_value_trade_min")]
    pub high_value_trade_min: i64,
    #[serde(default = "default_combat_ready_fighters")]
    pub combat_ready_fighters: i64,
    #[serde(default = "default_combat_ready_shields")]
    pub combat_ready_shields: i64,
    #[serde(default = "default_banking_threshold")]
    pub banking_threshold: i64,
    #[serde(default)]
    pub auto_apply: bool,
    /// Minimum surfaced priority: info | medium/warning | high | critical.
    #[serde(default = "default_min_priority")]
    pub min_priority: String,
    #[serde(default = "default_cooldown_turns")]
    pub cooldown_turns: u32,
    #[serde(default = "default_max_per_session")]
    pub max_per_session: u32,
    #[serde(default = "default_analysis_temperature")]
    pub analysis_temperature: f64,
    #[serde(default = "default_analysis_max_tokens")]
    pub analysis_max_tokens: u32,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_action_threshold: default_loop_action_threshold(),
            loop_sector_threshold: default_loop_sector_threshold(),
            stagnation_turns: default_stagnation_turns(),
            profit_decline_ratio: default_profit_decline_ratio(),
            turn_waste_threshold: default_turn_waste_threshold(),
            high_value_trade_min: default_high_value_trade_min(),
            combat_ready_fighters: default_combat_ready_fighters(),
            combat_ready_shields: default_combat_ready_shields(),
            banking_threshold: default_banking_threshold(),
            auto_apply: false,
            min_priority: default_min_priority(),
            cooldown_turns: default_cooldown_turns(),
            max_per_session: default_max_per_session(),
            analysis_temperature: default_analysis_temperature(),
            analysis_max_tokens: default_analysis_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiCharacterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_characters")]
    pub max_characters: u32,
    /// shared | independent | inherit_on_death
    #[serde(default = "default_knowledge_sharing")]
    pub knowledge_sharing: String,
}

impl Default for MultiCharacterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_characters: default_max_characters(),
            knowledge_sharing: default_knowledge_sharing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Usually supplied via BBSBOT_LLM_API_KEY instead of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            timeout_seconds: default_llm_timeout_seconds(),
            max_retries: default_llm_retries(),
            model: default_llm_model(),
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    #[serde(default = "default_max_turns")]
    pub max_turns_per_session: u32,
    /// Stop once the bot banks this many credits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_credits: Option<i64>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_turns_per_session: default_max_turns(),
            target_credits: None,
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmManagerConfig {
    #[serde(default = "default_manager_port")]
    pub port: u16,
    #[serde(default = "default_manager_host")]
    pub host: String,
    #[serde(default = "default_max_bots")]
    pub max_bots: u32,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Seconds between stuck-worker sweeps.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    /// Seconds between WebSocket status pushes.
    #[serde(default = "default_status_broadcast_interval")]
    pub status_broadcast_interval: u64,
    /// A running worker with no status update for this long is blocked.
    #[serde(default = "default_bot_timeout")]
    pub bot_timeout: u64,
    #[serde(default = "default_hijack_heartbeat_timeout")]
    pub hijack_heartbeat_timeout: u64,
}

impl Default for SwarmManagerConfig {
    fn default() -> Self {
        Self {
            port: default_manager_port(),
            host: default_manager_host(),
            max_bots: default_max_bots(),
            state_file: default_state_file(),
            health_check_interval: default_health_check_interval(),
            status_broadcast_interval: default_status_broadcast_interval(),
            bot_timeout: default_bot_timeout(),
            hijack_heartbeat_timeout: default_hijack_heartbeat_timeout(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration tree for one bot (and, when running the manager,
/// the swarm_manager group).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub character: CharacterConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub intervention: InterventionConfig,
    #[serde(default)]
    pub multi_character: MultiCharacterConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub session: SessionLimits,
    #[serde(default)]
    pub swarm_manager: SwarmManagerConfig,

    /// Game rules namespace (selects `<root>/games/<ns>/rules.json`).
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Root directory for all persisted state (§ persistence layout).
    #[serde(default = "default_persist_root")]
    pub persist_root: String,
    /// Explicit rules file path; overrides the namespace-derived default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        info!(
            path = %path.display(),
            host = %config.connection.host,
            strategy = %config.trading.strategy,
            "config loaded"
        );
        Ok(config)
    }

    /// Persist to `path` using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        Ok(())
    }

    /// Resolved rules-file path: explicit override or the conventional
    /// location under the persistence root.
    pub fn rules_file(&self) -> std::path::PathBuf {
        match &self.rules_path {
            Some(p) => std::path::PathBuf::from(p),
            None => crate::detect::rules::RuleSet::default_path(
                Path::new(&self.persist_root),
                &self.namespace,
            ),
        }
    }

    /// Apply environment overrides (BBSBOT_HOST, BBSBOT_PORT,
    /// BBSBOT_LLM_API_KEY, BBSBOT_LLM_BASE_URL).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("BBSBOT_HOST") {
            if !host.is_empty() {
                self.connection.host = host;
            }
        }
        if let Ok(port) = std::env::var("BBSBOT_PORT") {
            if let Ok(port) = port.parse() {
                self.connection.port = port;
            }
        }
        if let Ok(key) = std::env::var("BBSBOT_LLM_API_KEY") {
            if !key.is_empty() {
                self.llm.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("BBSBOT_LLM_BASE_URL") {
            if !url.is_empty() {
                self.llm.base_url = Some(url);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.connection.host, "localhost");
        assert_eq!(cfg.connection.port, 23);
        assert_eq!(cfg.connection.cols, 80);
        assert_eq!(cfg.connection.rows, 25);
        assert_eq!(cfg.trading.strategy, StrategyKind::ProfitablePairs);
        assert_eq!(cfg.intervention.loop_action_threshold, 3);
        assert_eq!(cfg.intervention.loop_sector_threshold, 4);
        assert_eq!(cfg.intervention.stagnation_turns, 15);
        assert_eq!(cfg.intervention.cooldown_turns, 5);
        assert_eq!(cfg.intervention.max_per_session, 20);
        assert_eq!(cfg.intervention.high_value_trade_min, 5000);
        assert_eq!(cfg.swarm_manager.bot_timeout, 60);
        assert_eq!(cfg.swarm_manager.status_broadcast_interval, 5);
        assert_eq!(cfg.swarm_manager.health_check_interval, 10);
        assert_eq!(cfg.swarm_manager.hijack_heartbeat_timeout, 30);
        assert_eq!(cfg.trading.ai_strategy.fallback_threshold, 3);
        assert_eq!(cfg.trading.ai_strategy.history_window, 10);
        assert_eq!(cfg.namespace, "tw2002");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.connection.term_name, "ansi");
        assert_eq!(cfg.session.max_turns_per_session, 200);
        assert!(cfg.intervention.enabled);
        assert!(!cfg.intervention.auto_apply);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "connection": { "host": "bbs.example.net", "port": 2002 },
            "trading": { "strategy": "opportunistic" }
        }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.connection.host, "bbs.example.net");
        assert_eq!(cfg.connection.port, 2002);
        assert_eq!(cfg.connection.cols, 80);
        assert_eq!(cfg.trading.strategy, StrategyKind::Opportunistic);
        assert!((cfg.trading.opportunistic.explore_chance - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.json");

        let mut cfg = BotConfig::default();
        cfg.connection.host = "game.example".to_string();
        cfg.trading.strategy = StrategyKind::AiStrategy;
        cfg.save(&path).unwrap();

        let loaded = BotConfig::load(&path).unwrap();
        assert_eq!(loaded.connection.host, "game.example");
        assert_eq!(loaded.trading.strategy, StrategyKind::AiStrategy);
    }

    #[test]
    fn rules_file_resolution() {
        let mut cfg = BotConfig::default();
        assert_eq!(
            cfg.rules_file(),
            Path::new("data/games/tw2002/rules.json")
        );
        cfg.rules_path = Some("/etc/bbsbot/rules.json".to_string());
        assert_eq!(cfg.rules_file(), Path::new("/etc/bbsbot/rules.json"));
    }
}
